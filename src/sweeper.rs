use std::{io::ErrorKind, path::Path, time::SystemTime};

use tokio::time::Duration;
use tracing::{info, warn};

/// Deletes scratch files older than `older_than_secs`; returns how many were removed.
///
/// Jobs clean up after themselves, so anything this finds was left behind by a crash or a
/// killed process. A zero age disables the sweep.
pub async fn sweep_stale_files(transfer_dir: &Path, older_than_secs: u64) -> usize {
    if older_than_secs == 0 {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(transfer_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open {:?} for cleanup: {error}", transfer_dir);
            }
            return 0;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("could not list {:?} for cleanup: {error}", transfer_dir);
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!("could not read modification time of {:?}: {error}", path);
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("removed {removed} stale file(s) from {:?}", transfer_dir);
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removes_only_old_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.mp4");
        let fresh = dir.path().join("fresh.mp4");
        std::fs::write(&old, b"old").expect("write");
        std::fs::write(&fresh, b"fresh").expect("write");

        let three_hours_ago = SystemTime::now() - Duration::from_secs(3 * 60 * 60);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .and_then(|file| file.set_modified(three_hours_ago))
            .expect("set mtime");

        let removed = sweep_stale_files(dir.path(), 2 * 60 * 60).await;

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn zero_age_disables_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"a").expect("write");

        assert_eq!(sweep_stale_files(dir.path(), 0).await, 0);
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 1);
    }

    #[tokio::test]
    async fn missing_directory_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(sweep_stale_files(&dir.path().join("absent"), 60).await, 0);
    }
}
