//! Filesystem free/total space queries for the workspace cache directory.

use std::path::Path;

use serde::Serialize;

/// Free, total, and used byte counts for the filesystem hosting a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskStats {
    /// Total capacity of the filesystem.
    pub total_bytes: u64,
    /// Bytes currently free (available to this process).
    pub free_bytes: u64,
    /// Bytes currently in use (`total_bytes - free_bytes`).
    pub used_bytes: u64,
}

/// Queries free/total space on the filesystem that hosts `path`.
///
/// `path` does not need to exist yet; `fs2` resolves stats from the nearest
/// existing ancestor's mount point on all platforms we target.
///
/// # Errors
///
/// Returns the underlying IO error if the path (or its existing ancestors)
/// cannot be statted.
pub fn disk_stats(path: &Path) -> Result<DiskStats, std::io::Error> {
    let probe = nearest_existing_ancestor(path);
    let total_bytes = fs2::total_space(&probe)?;
    let free_bytes = fs2::available_space(&probe)?;
    let used_bytes = total_bytes.saturating_sub(free_bytes);

    Ok(DiskStats {
        total_bytes,
        free_bytes,
        used_bytes,
    })
}

fn nearest_existing_ancestor(path: &Path) -> std::path::PathBuf {
    let mut candidate = path;
    loop {
        if candidate.exists() {
            return candidate.to_path_buf();
        }
        match candidate.parent() {
            Some(parent) => candidate = parent,
            None => return std::path::PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_bytes_is_total_minus_free() {
        let tmp = tempfile::tempdir().unwrap();
        let stats = disk_stats(tmp.path()).unwrap();
        assert_eq!(stats.used_bytes, stats.total_bytes - stats.free_bytes);
        assert!(stats.total_bytes >= stats.free_bytes);
    }

    #[test]
    fn resolves_stats_for_a_not_yet_created_subpath() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does/not/exist/yet");
        let stats = disk_stats(&missing).unwrap();
        assert!(stats.total_bytes > 0);
    }
}
