use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::{Engine, SweepReport};
use crate::error::EngineError;
use crate::utils::now_millis;

#[derive(Clone, Debug, Default, Serialize)]
pub struct SnapshotCycleReport {
    pub users: usize,
    pub snapshots: usize,
    pub removals: usize,
    pub failures: Vec<CycleFailure>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleFailure {
    pub user_id: String,
    pub tracked_playlist_id: Option<u64>,
    pub message: String,
}

#[derive(Default)]
struct UserRun {
    snapshots: usize,
    removals: usize,
    failures: Vec<CycleFailure>,
}

/// Snapshots every active tracked playlist of every user with snapshots enabled.
/// Users run concurrently; one user's playlists run in order.
pub async fn run_snapshot_cycle(engine: &Engine) -> Result<SnapshotCycleReport, EngineError> {
    let users: Vec<String> = engine
        .store()
        .list_settings()?
        .into_iter()
        .filter(|settings| settings.snapshots_enabled)
        .map(|settings| settings.user_id)
        .collect();

    let mut handles = Vec::with_capacity(users.len());
    for user_id in users {
        let engine = engine.clone();
        let task_user = user_id.clone();
        let handle = tokio::spawn(async move { run_user(&engine, &task_user).await });
        handles.push((user_id, handle));
    }

    let mut report = SnapshotCycleReport {
        users: handles.len(),
        ..SnapshotCycleReport::default()
    };
    for (user_id, handle) in handles {
        match handle.await {
            Ok(run) => {
                report.snapshots += run.snapshots;
                report.removals += run.removals;
                report.failures.extend(run.failures);
            }
            Err(err) => {
                error!("Snapshot task for user {} panicked: {}", user_id, err);
                report.failures.push(CycleFailure {
                    user_id,
                    tracked_playlist_id: None,
                    message: err.to_string(),
                });
            }
        }
    }
    info!(
        "Snapshot cycle finished: users={} snapshots={} removals={} failures={}",
        report.users,
        report.snapshots,
        report.removals,
        report.failures.len()
    );
    Ok(report)
}

async fn run_user(engine: &Engine, user_id: &str) -> UserRun {
    let mut run = UserRun::default();
    let playlists = match engine.store().list_tracked_playlists(user_id) {
        Ok(playlists) => playlists,
        Err(err) => {
            run.failures.push(CycleFailure {
                user_id: user_id.to_string(),
                tracked_playlist_id: None,
                message: err.to_string(),
            });
            return run;
        }
    };
    for playlist in playlists.into_iter().filter(|playlist| playlist.active) {
        match engine.run_playlist(user_id, playlist.id).await {
            Ok(result) => {
                run.snapshots += 1;
                run.removals += result.removals.inserted;
            }
            Err(err) => {
                warn!(
                    "Snapshot of playlist {} for user {} failed: {}",
                    playlist.id, user_id, err
                );
                let stop = matches!(err, EngineError::Unauthenticated(_));
                run.failures.push(CycleFailure {
                    user_id: user_id.to_string(),
                    tracked_playlist_id: Some(playlist.id),
                    message: err.to_string(),
                });
                // Without a usable grant every remaining playlist fails the same way.
                if stop {
                    break;
                }
            }
        }
    }
    run
}

pub async fn run_sweep(engine: &Engine) -> Result<SweepReport, EngineError> {
    engine.sweep_expired(now_millis()).await
}

/// Runs snapshot cycles and sweeps on fixed intervals until the process exits.
pub fn spawn_scheduler(engine: Engine, config: &SchedulerConfig) {
    let snapshot_every = Duration::from_secs(config.snapshot_interval_secs);
    let sweep_every = Duration::from_secs(config.sweep_interval_secs);

    let snapshot_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = run_snapshot_cycle(&snapshot_engine).await {
                error!("Scheduled snapshot cycle failed: {}", err);
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = run_sweep(&engine).await {
                error!("Scheduled sweep failed: {}", err);
            }
        }
    });

    info!(
        "Scheduler started: snapshots every {}s, sweep every {}s",
        snapshot_every.as_secs(),
        sweep_every.as_secs()
    );
}

#[cfg(test)]
mod tests {
    use library::SettingsUpdate;

    use super::run_snapshot_cycle;
    use crate::testing::TestEnv;

    #[tokio::test]
    async fn cycle_snapshots_every_active_playlist_of_enabled_users() {
        let env = TestEnv::new();
        let first = env.track_playlist("pl-1");
        let second = env.track_playlist("pl-2");
        let paused = env.track_playlist("pl-3");
        env.deactivate(paused.id);
        env.upstream.set_listing("pl-1", &["a", "b"]);
        env.upstream.set_listing("pl-2", &["c"]);

        env.store.get_or_create_settings("user-2", 0).unwrap();
        env.store
            .update_settings(
                "user-2",
                SettingsUpdate {
                    snapshots_enabled: Some(false),
                    ..SettingsUpdate::default()
                },
                0,
            )
            .unwrap();

        let report = run_snapshot_cycle(&env.engine).await.unwrap();
        assert_eq!(report.users, 1);
        assert_eq!(report.snapshots, 2);
        assert!(report.failures.is_empty());
        for id in [first.id, second.id] {
            assert_eq!(env.store.latest_snapshots(&env.user_id, id, 2).unwrap().len(), 1);
        }
        assert!(env
            .store
            .latest_snapshots(&env.user_id, paused.id, 2)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn user_without_grant_stops_after_first_failure() {
        let env = TestEnv::new();
        env.store.get_or_create_settings("user-2", 0).unwrap();
        let (a, _) = env.store.ensure_liked_songs("user-2", 0).unwrap();
        let report = run_snapshot_cycle(&env.engine).await.unwrap();
        assert_eq!(report.users, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].user_id, "user-2");
        assert_eq!(report.failures[0].tracked_playlist_id, Some(a.id));
    }
}
