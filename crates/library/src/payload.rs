use std::collections::HashSet;
use std::io::{Read, Write};

use common::SnapshotTrack;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Drops repeated track ids, keeping the first occurrence and the original order.
pub fn collapse_duplicates(tracks: Vec<SnapshotTrack>) -> Vec<SnapshotTrack> {
    let mut seen = HashSet::with_capacity(tracks.len());
    tracks
        .into_iter()
        .filter(|track| seen.insert(track.id.clone()))
        .collect()
}

/// Serializes tracks as a JSON array and gzips it.
pub fn encode_payload(tracks: &[SnapshotTrack]) -> Result<Vec<u8>, PayloadError> {
    let json = serde_json::to_vec(tracks)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decode_payload(bytes: &[u8]) -> Result<Vec<SnapshotTrack>, PayloadError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[derive(Debug)]
pub enum PayloadError {
    Compression(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Compression(err) => write!(f, "gzip error: {}", err),
            PayloadError::Json(err) => write!(f, "json error: {}", err),
        }
    }
}

impl std::error::Error for PayloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PayloadError::Compression(err) => Some(err),
            PayloadError::Json(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for PayloadError {
    fn from(err: std::io::Error) -> Self {
        PayloadError::Compression(err)
    }
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        PayloadError::Json(err)
    }
}
