//! Free-space check used before writing a backup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::Disks;

use crate::error::{Error, Result};

#[async_trait]
pub trait DiskSpace: Send + Sync {
    /// Bytes available to unprivileged writers on the volume holding `path`.
    async fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Reads mounted volumes through `sysinfo` and picks the one whose mount
/// point is the longest prefix of the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskSpace;

#[async_trait]
impl DiskSpace for SystemDiskSpace {
    async fn available_bytes(&self, path: &Path) -> Result<u64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        tokio::task::spawn_blocking(move || free_bytes_at(&path))
            .await
            .map_err(|e| Error::BackupFailed(format!("disk space lookup panicked: {e}")))?
    }
}

fn free_bytes_at(path: &Path) -> Result<u64> {
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, u64)> = disks
        .list()
        .iter()
        .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()))
        .collect();
    best_match(path, &mounts).ok_or_else(|| {
        Error::BackupFailed(format!("no mounted volume holds {}", path.display()))
    })
}

fn best_match(path: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| *available)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_mount_point_wins() {
        let mounts = vec![
            (PathBuf::from("/"), 10),
            (PathBuf::from("/home"), 20),
            (PathBuf::from("/home/user/data"), 30),
        ];

        assert_eq!(best_match(Path::new("/home/user/data/db"), &mounts), Some(30));
        assert_eq!(best_match(Path::new("/home/other"), &mounts), Some(20));
        assert_eq!(best_match(Path::new("/var/lib"), &mounts), Some(10));
    }

    #[test]
    fn prefix_is_component_wise() {
        let mounts = vec![(PathBuf::from("/home"), 20)];
        assert_eq!(best_match(Path::new("/homework"), &mounts), None);
    }
}
