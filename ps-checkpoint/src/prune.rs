//! Drop old snapshot directories once a shard has more than `max_save_count`.

use std::path::Path;

use ps_errors::PsResult;
use tracing::warn;
use walkdir::WalkDir;

/// List timestamp-named subdirectories of `shard_dir` directly (depth 1),
/// newest first.
fn snapshot_timestamps(shard_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = WalkDir::new(shard_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_owned))
        .collect();
    names.sort_unstable_by(|a, b| b.cmp(a));
    names
}

/// Keep the `max_save_count` newest snapshots under `shard_dir`, removing
/// the rest. Called after a successful write, so the just-written snapshot
/// is never the one pruned away.
pub fn prune_old_snapshots(shard_dir: &Path, max_save_count: usize) -> PsResult<()> {
    let timestamps = snapshot_timestamps(shard_dir);
    for stale in timestamps.into_iter().skip(max_save_count) {
        let path = shard_dir.join(&stale);
        if let Err(e) = std::fs::remove_dir_all(&path) {
            warn!(error = %e, path = %path.display(), "failed to prune old snapshot");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_n_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        for ts in ["2024-01-01-00-00-00", "2024-01-02-00-00-00", "2024-01-03-00-00-00"] {
            std::fs::create_dir_all(dir.path().join(ts)).unwrap();
        }
        prune_old_snapshots(dir.path(), 2).unwrap();
        let remaining = snapshot_timestamps(dir.path());
        assert_eq!(remaining, vec!["2024-01-03-00-00-00", "2024-01-02-00-00-00"]);
    }
}
