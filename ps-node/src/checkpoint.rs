//! Node-side load: reassemble this node's share of the newest snapshot set
//! under its configured save directory, against its *current* router, and
//! apply it through the same idempotent `receive_*` paths a live transfer
//! uses. The scheduler never touches disk itself (it only ever learns a
//! `save_dir`/`max_save_count` exists, never their values), so both the
//! directory walk and the table reconstruction happen here.

use ps_checkpoint::{discover_shards, donors_for, latest_per_node, load_dense_tables, load_sparse_rows, read_model, read_router};
use ps_errors::PsResult;
use ps_wire::ModelMetaData;
use tracing::warn;

use crate::node::PsNode;

/// Run a full load against `node`'s current router. `None` means no
/// snapshot has ever been written under `node.save_dir()`.
pub fn run_load(node: &PsNode) -> PsResult<Option<ModelMetaData>> {
    let shards = discover_shards(node.save_dir());
    let latest = latest_per_node(&shards);
    let Some(any_shard) = latest.values().next() else {
        return Ok(None);
    };

    let old_router = read_router(any_shard)?;
    let current_router = node.router();
    let donor_ids = donors_for(&old_router, &current_router, node.node_id);
    let Some(mdata_shard) = donor_ids.iter().find_map(|id| latest.get(id)) else {
        return Ok(None);
    };
    let mdata = read_model(mdata_shard)?;

    if let Err(e) = node.create_model(mdata.name.clone(), mdata.optim.clone()) {
        warn!(error = %e, "load found a model already present, keeping it");
    }

    for donor_id in &donor_ids {
        let Some(shard) = latest.get(donor_id) else { continue };
        for record in load_dense_tables(shard, &current_router, node.node_id)? {
            node.receive_dense(record.table_id, record.table_name, record.value)?;
        }
        for (record, rows) in load_sparse_rows(shard, &current_router, node.node_id)? {
            node.receive_sparse_meta(
                record.table_id,
                record.table_name,
                record.dimension,
                record.element_type,
                record.init_spec.clone(),
            )?;
            if !rows.is_empty() {
                let (ids, values): (Vec<u64>, Vec<_>) = rows.into_iter().unzip();
                node.receive_sparse_rows(record.table_id, &ids, &values)?;
            }
        }
    }

    Ok(Some(mdata))
}
