use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// Durable blob storage for compressed snapshot payloads.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ObjectError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectError>;
    fn delete(&self, key: &str) -> Result<bool, ObjectError>;
    /// Removes every object under `prefix/`. Returns the number of objects removed.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, ObjectError>;
}

/// Filesystem-backed object store; keys map to relative paths below `root`.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Result<Self, ObjectError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectError> {
        let trimmed = key.trim_matches('/');
        if trimmed.is_empty() {
            return Err(ObjectError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(trimmed);
        let safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(ObjectError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ObjectError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("partial");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(key.to_string())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ObjectError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ObjectError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, ObjectError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, ObjectError> {
        let dir = self.path_for(prefix)?;
        if !dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0usize;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                removed += 1;
            }
        }
        fs::remove_dir_all(&dir)?;
        Ok(removed)
    }
}

#[derive(Debug)]
pub enum ObjectError {
    NotFound(String),
    InvalidKey(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectError::NotFound(key) => write!(f, "object not found: {}", key),
            ObjectError::InvalidKey(key) => write!(f, "invalid object key: {}", key),
            ObjectError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for ObjectError {}

impl From<std::io::Error> for ObjectError {
    fn from(err: std::io::Error) -> Self {
        ObjectError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{FsObjectStore, ObjectError, ObjectStore};

    #[test]
    fn put_then_get_returns_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();
        let key = store.put("user-1/snapshot_1_abc.json.gz", b"payload").unwrap();
        assert_eq!(key, "user-1/snapshot_1_abc.json.gz");
        assert_eq!(store.get(&key).unwrap(), b"payload");
    }

    #[test]
    fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();
        let err = store.get("user-1/missing.json.gz").unwrap_err();
        assert!(matches!(err, ObjectError::NotFound(_)));
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();
        let err = store.put("../escape.json.gz", b"x").unwrap_err();
        assert!(matches!(err, ObjectError::InvalidKey(_)));
    }

    #[test]
    fn delete_prefix_removes_user_objects_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf()).unwrap();
        store.put("user-1/a.json.gz", b"a").unwrap();
        store.put("user-1/b.json.gz", b"b").unwrap();
        store.put("user-2/c.json.gz", b"c").unwrap();
        assert_eq!(store.delete_prefix("user-1").unwrap(), 2);
        assert!(store.get("user-1/a.json.gz").is_err());
        assert_eq!(store.get("user-2/c.json.gz").unwrap(), b"c");
        assert_eq!(store.delete_prefix("user-1").unwrap(), 0);
    }
}
