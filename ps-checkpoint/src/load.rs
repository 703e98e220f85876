//! Discover shard directories across every known save, and reassemble the
//! subset of keys a given node owns under its *current* router — possibly
//! a different cluster size than the one the snapshot was taken under.
//!
//! Grounded in spec.md §4.7's load procedure: the donor set for a node is
//! exactly `old_router.intersect_nodes(current_router.node_hash_ranges(id))`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ps_errors::PsResult;
use ps_router::Router;
use ps_tensor::DenseTensor;
use ps_wire::ModelMetaData;
use walkdir::WalkDir;

use crate::layout;
use crate::record::{DenseRecord, SparseRecord};

#[derive(Debug, Clone)]
pub struct ShardRef {
    pub node_id: u64,
    pub timestamp: String,
    pub path: PathBuf,
}

/// Every `shard_<id>/<timestamp>` directory under `save_dir`, across every
/// node id and every timestamp ever written there.
pub fn discover_shards(save_dir: &Path) -> Vec<ShardRef> {
    let mut out = Vec::new();
    for shard_entry in WalkDir::new(save_dir).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !shard_entry.file_type().is_dir() {
            continue;
        }
        let Some(node_id) = shard_entry
            .file_name()
            .to_str()
            .and_then(|n| n.strip_prefix("shard_"))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        for ts_entry in WalkDir::new(shard_entry.path()).min_depth(1).max_depth(1).into_iter().filter_map(|e| e.ok()) {
            if !ts_entry.file_type().is_dir() {
                continue;
            }
            if let Some(timestamp) = ts_entry.file_name().to_str() {
                out.push(ShardRef { node_id, timestamp: timestamp.to_string(), path: ts_entry.into_path() });
            }
        }
    }
    out
}

/// Reduce to the newest snapshot per node id (older ones for the same node
/// are superseded, never read).
pub fn latest_per_node(shards: &[ShardRef]) -> HashMap<u64, ShardRef> {
    let mut out: HashMap<u64, ShardRef> = HashMap::new();
    for shard in shards {
        match out.get(&shard.node_id) {
            Some(existing) if existing.timestamp >= shard.timestamp => {}
            _ => {
                out.insert(shard.node_id, shard.clone());
            }
        }
    }
    out
}

pub fn read_router(shard: &ShardRef) -> PsResult<Router> {
    let bytes = std::fs::read(layout::router_binary(&shard.path))?;
    Ok(bincode::deserialize(&bytes)?)
}

pub fn read_model(shard: &ShardRef) -> PsResult<ModelMetaData> {
    let bytes = std::fs::read(layout::model_binary(&shard.path))?;
    Ok(bincode::deserialize(&bytes)?)
}

/// The old node ids whose shards this node (under `current_router`) must
/// read: every incumbent that owned part of `my_node_id`'s new ranges under
/// `old_router`.
pub fn donors_for(old_router: &Router, current_router: &Router, my_node_id: u64) -> Vec<u64> {
    let my_ranges = current_router.node_hash_ranges(my_node_id);
    let mut donors: Vec<u64> = old_router.intersect_nodes(&my_ranges).into_iter().collect();
    donors.sort_unstable();
    donors
}

fn dense_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "dense"))
        .map(|e| e.into_path())
        .collect()
}

fn sparse_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "sparse"))
        .map(|e| e.into_path())
        .collect()
}

/// Dense tables from `shard` whose table id currently routes to
/// `my_node_id`; anything else in the shard belongs to a different node
/// now and is skipped.
pub fn load_dense_tables(shard: &ShardRef, current_router: &Router, my_node_id: u64) -> PsResult<Vec<DenseRecord>> {
    let mut out = Vec::new();
    for path in dense_files(&shard.path) {
        let bytes = std::fs::read(&path)?;
        let record: DenseRecord = bincode::deserialize(&bytes)?;
        if current_router.hit_dense(record.table_id) == Some(my_node_id) {
            out.push(record);
        }
    }
    Ok(out)
}

/// Sparse rows from `shard`, filtered row-by-row to those that currently
/// route to `my_node_id` (a sparse table shell is cluster-wide; only its
/// rows are partitioned).
pub fn load_sparse_rows(
    shard: &ShardRef,
    current_router: &Router,
    my_node_id: u64,
) -> PsResult<Vec<(SparseRecord, Vec<(u64, DenseTensor)>)>> {
    let mut out = Vec::new();
    for path in sparse_files(&shard.path) {
        let bytes = std::fs::read(&path)?;
        let record: SparseRecord = bincode::deserialize(&bytes)?;
        let owned_rows: Vec<(u64, DenseTensor)> = record
            .slots
            .iter()
            .flat_map(|slot| slot.rows.iter().cloned())
            .filter(|(sparse_id, _)| current_router.hit_sparse(record.table_id, *sparse_id) == Some(my_node_id))
            .collect();
        out.push((record, owned_rows));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_per_node_keeps_the_newest_timestamp() {
        let shards = vec![
            ShardRef { node_id: 0, timestamp: "2024-01-01-00-00-00".into(), path: "/a".into() },
            ShardRef { node_id: 0, timestamp: "2024-01-02-00-00-00".into(), path: "/b".into() },
            ShardRef { node_id: 1, timestamp: "2024-01-01-00-00-00".into(), path: "/c".into() },
        ];
        let latest = latest_per_node(&shards);
        assert_eq!(latest[&0].timestamp, "2024-01-02-00-00-00");
        assert_eq!(latest[&1].timestamp, "2024-01-01-00-00-00");
    }

    #[test]
    fn donors_for_a_grown_cluster_cover_every_incumbent_range() {
        let mut old = Router::new();
        old.add(0, "a".into());
        old.add(1, "b".into());
        let mut current = old.clone();
        current.add(2, "c".into());
        let donors = donors_for(&old, &current, 2);
        assert!(!donors.is_empty());
        assert!(donors.iter().all(|id| *id == 0 || *id == 1));
    }
}
