//! Periodic reclamation of expired files in the output directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::{
    task::JoinHandle,
    time::{Duration, MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::storage::OutputDirectory;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub retained: usize,
    pub leased: usize,
    pub failed: usize,
}

pub fn spawn_retention_sweeper(
    output: OutputDirectory,
    every: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = sweep_expired(&output, max_age, SystemTime::now()).await;
            if report.removed > 0 || report.failed > 0 {
                info!(
                    "Retention sweep removed {} entries ({} kept, {} in use, {} failed)",
                    report.removed, report.retained, report.leased, report.failed
                );
            }
        }
    })
}

/// Deletes every entry whose last modification is more than `max_age`
/// before `now`, except paths a request still holds.
pub async fn sweep_expired(output: &OutputDirectory, max_age: Duration, now: SystemTime) -> SweepReport {
    let mut entries = match tokio::fs::read_dir(output.root()).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open output directory for sweeping: {error}");
            }
            return SweepReport::default();
        }
    };

    let mut paths = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => paths.push(entry.path()),
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate output directory for sweeping: {error}");
                break;
            }
        }
    }

    sweep_paths(output, &paths, max_age, now).await
}

/// Each path is handled on its own; one failure is logged and counted and
/// the rest are still swept.
pub async fn sweep_paths(
    output: &OutputDirectory,
    paths: &[PathBuf],
    max_age: Duration,
    now: SystemTime,
) -> SweepReport {
    let mut report = SweepReport::default();

    for path in paths {
        if output.is_leased(path) {
            report.leased += 1;
            continue;
        }

        match sweep_one(path, max_age, now).await {
            Ok(true) => {
                debug!("Removed expired {:?}", path);
                report.removed += 1;
            }
            Ok(false) => report.retained += 1,
            Err(error) => {
                warn!("Could not sweep {:?}: {error}", path);
                report.failed += 1;
            }
        }
    }

    report
}

pub fn is_expired(modified_at: SystemTime, now: SystemTime, max_age: Duration) -> bool {
    // A modification time in the future counts as brand new.
    now.duration_since(modified_at)
        .is_ok_and(|age| age > max_age)
}

async fn sweep_one(path: &Path, max_age: Duration, now: SystemTime) -> std::io::Result<bool> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if !is_expired(metadata.modified()?, now, max_age) {
        return Ok(false);
    }

    let removal = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match removal {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(300);

    fn touch(path: &Path) -> SystemTime {
        std::fs::write(path, b"data").unwrap();
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn expiry_is_strictly_older_than_threshold() {
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        assert!(is_expired(modified, modified + RETENTION + Duration::from_secs(1), RETENTION));
        assert!(!is_expired(modified, modified + RETENTION - Duration::from_secs(1), RETENTION));
        assert!(!is_expired(modified, modified - Duration::from_secs(60), RETENTION));
    }

    #[tokio::test]
    async fn removes_old_files_and_keeps_young_ones() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let modified = touch(&dir.path().join("clip.mp4"));

        let young = sweep_expired(&output, RETENTION, modified + RETENTION - Duration::from_secs(1)).await;
        assert_eq!(young.retained, 1);
        assert!(dir.path().join("clip.mp4").exists());

        let old = sweep_expired(&output, RETENTION, modified + RETENTION + Duration::from_secs(1)).await;
        assert_eq!(old.removed, 1);
        assert!(!dir.path().join("clip.mp4").exists());
    }

    #[tokio::test]
    async fn leased_files_survive_regardless_of_age() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let scratch = output.reserve("in_flight_video.mp4");
        let modified = touch(scratch.path());

        let report = sweep_expired(&output, RETENTION, modified + Duration::from_secs(3_600)).await;
        assert_eq!(report.leased, 1);
        assert_eq!(report.removed, 0);
        assert!(scratch.path().exists());
    }

    #[tokio::test]
    async fn expired_directories_are_removed_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let job = dir.path().join("job");
        std::fs::create_dir(&job).unwrap();
        std::fs::write(job.join("part.mp4"), b"x").unwrap();
        let modified = std::fs::metadata(&job).unwrap().modified().unwrap();

        let report = sweep_expired(&output, RETENTION, modified + RETENTION * 2).await;
        assert_eq!(report.removed, 1);
        assert!(!job.exists());
    }

    #[tokio::test]
    async fn sweep_continues_past_a_failing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path());
        let first = dir.path().join("a.mp4");
        let vanished = dir.path().join("vanished.mp4");
        let last = dir.path().join("z.mp4");
        let modified = touch(&first);
        touch(&last);

        let report = sweep_paths(
            &output,
            &[first.clone(), vanished, last.clone()],
            RETENTION,
            modified + RETENTION * 2,
        )
        .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 2);
        assert!(!first.exists());
        assert!(!last.exists());
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirectory::new(dir.path().join("never-created"));
        let report = sweep_expired(&output, RETENTION, SystemTime::now()).await;
        assert_eq!(report, SweepReport::default());
    }
}
