//! Write one node's snapshot to `<save_dir>/shard_<node_id>/<timestamp>/`.
//!
//! Acquiring `model_mu` (shared) and, per sparse table, the per-slot shared
//! lock slot-by-slot, is the caller's job (`ps-node`'s save handler) — this
//! module only serializes whatever table references it's handed, so no
//! lock from `ps-table` needs to be visible here.

use std::path::Path;

use ps_errors::PsResult;
use ps_router::Router;
use ps_table::{DenseTable, SparseTable};
use ps_wire::ModelMetaData;

use crate::layout;
use crate::record::{DenseRecord, SparseRecord, SparseSlot};

/// Serialize `router`, `mdata`, every table in `dense_tables`/
/// `sparse_tables`, to a fresh snapshot directory; then prune older
/// snapshots for this node down to `max_save_count`.
pub fn write_snapshot(
    save_dir: &Path,
    node_id: u64,
    timestamp: &str,
    router: &Router,
    mdata: &ModelMetaData,
    dense_tables: &[&DenseTable],
    sparse_tables: &[&SparseTable],
    max_save_count: usize,
) -> PsResult<()> {
    let dir = layout::snapshot_dir(save_dir, node_id, timestamp);
    std::fs::create_dir_all(&dir)?;

    std::fs::write(layout::router_json(&dir), serde_json::to_vec_pretty(router)?)?;
    std::fs::write(layout::router_binary(&dir), bincode::serialize(router)?)?;
    std::fs::write(layout::model_json(&dir), serde_json::to_vec_pretty(mdata)?)?;
    std::fs::write(layout::model_binary(&dir), bincode::serialize(mdata)?)?;

    for table in dense_tables {
        let record = DenseRecord::new(table.table_id, table.name.clone(), table.pull());
        std::fs::write(layout::dense_file(&dir, &table.name), bincode::serialize(&record)?)?;
    }

    for table in sparse_tables {
        let slots = (0..table.slot_count())
            .map(|idx| SparseSlot { rows: table.batch_from(idx, 0, usize::MAX) })
            .collect();
        let record = SparseRecord::new(
            table.table_id,
            table.name.clone(),
            table.dimension,
            table.element_type,
            table.init_spec.clone(),
            slots,
        );
        std::fs::write(layout::sparse_file(&dir, &table.name), bincode::serialize(&record)?)?;
    }

    crate::prune::prune_old_snapshots(&layout::shard_dir(save_dir, node_id), max_save_count)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_tensor::{ElementType, Initializer};
    use ps_wire::OptimConfig;

    #[test]
    fn write_snapshot_creates_every_expected_file() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new();
        let mdata = ModelMetaData {
            name: "m".into(),
            optim: OptimConfig { kind: "sgd".into(), params: vec![] },
            dense_tables: vec![(0, "w0".into())],
            sparse_tables: vec![],
        };
        let dense = DenseTable::new(
            0,
            "w0".into(),
            ps_tensor::DenseTensor::new(vec![2], ElementType::F32, vec![1.0, 2.0]),
        );
        let sparse = SparseTable::new(1, "emb".into(), 4, ElementType::F32, Initializer::Constant(0.0));
        sparse.insert(&[7], &[ps_tensor::DenseTensor::new(vec![4], ElementType::F32, vec![1.0; 4])]);

        write_snapshot(
            dir.path(),
            2,
            "2024-01-02-03-04-05",
            &router,
            &mdata,
            &[&dense],
            &[&sparse],
            3,
        )
        .unwrap();

        let snap = layout::snapshot_dir(dir.path(), 2, "2024-01-02-03-04-05");
        assert!(layout::router_json(&snap).exists());
        assert!(layout::router_binary(&snap).exists());
        assert!(layout::model_binary(&snap).exists());
        assert!(layout::dense_file(&snap, "w0").exists());
        assert!(layout::sparse_file(&snap, "emb").exists());
    }
}
