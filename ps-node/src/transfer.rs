//! Donor -> joiner streaming, and the joiner's proxy read-through.
//!
//! Grounded in `original_source/kraken/ps/transfer.h`'s `Transfer`: one
//! instance per (donor, joiner) pair, iterating tables and sparse slots with
//! a short-lived lock per batch, retrying each RPC a bounded number of times
//! before giving up on that batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ps_errors::{PsError, PsResult};
use ps_tensor::{DenseTensor, ElementType};
use ps_util::retry::transfer_backoff;
use ps_wire::{client_service, CompressKind, RpcReply, RpcRequest, Tagged};
use tower_service::Service;
use tracing::warn;

use crate::node::PsNode;

const SPARSE_BATCH_SIZE: usize = 256;
const TRANSFER_TRIES: u32 = 3;

static NEXT_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

async fn call(addr: &str, req: RpcRequest) -> PsResult<RpcReply> {
    let socket: std::net::SocketAddr = addr
        .parse()
        .map_err(|e: std::net::AddrParseError| PsError::Internal(e.to_string()))?;
    let timestamp = NEXT_TIMESTAMP.fetch_add(1, Ordering::Relaxed);
    let kind = req.kind();
    let frame = ps_wire::encode_request(timestamp, kind, &req, CompressKind::None)?;
    let mut svc = client_service(socket);
    std::future::poll_fn(|cx| svc.poll_ready(cx))
        .await
        .map_err(|e| PsError::Internal(e.to_string()))?;
    let reply = svc
        .call(Tagged::new(0, frame))
        .await
        .map_err(|e| PsError::Internal(e.to_string()))?;
    ps_wire::decode_reply(&reply.v)
}

/// Retry a single RPC against `addr` up to `TRANSFER_TRIES` times, sleeping
/// between attempts per `transfer_backoff`. Gives up (returning the last
/// error) once the schedule is exhausted.
async fn call_with_retry(addr: &str, req: RpcRequest) -> PsResult<RpcReply> {
    let backoff = transfer_backoff(TRANSFER_TRIES);
    let mut last_err = None;
    for wait in &backoff {
        match call(addr, req.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                last_err = Some(e);
                match wait {
                    Some(d) => tokio::time::sleep(d).await,
                    None => break,
                }
            }
        }
    }
    Err(last_err.unwrap_or(PsError::TimeoutError))
}

fn element_type_from_byte(b: u8) -> ElementType {
    match b {
        1 => ElementType::F64,
        2 => ElementType::I32,
        3 => ElementType::I64,
        _ => ElementType::F32,
    }
}

/// Run as a background task on the donor once `apply_notify_node_join`
/// reports this node as a donor for `joiner_id`: stream every dense table
/// and sparse row this node still owns but the joiner now does, then clear
/// `Transfer` and drop whatever this node no longer owns.
pub async fn run_donor_transfer(node: Arc<PsNode>, joiner_id: u64, joiner_addr: String) {
    for table_id in node.dense_table_ids() {
        let Some((name, value)) = node.dense_table_snapshot(table_id) else {
            continue;
        };
        let req = RpcRequest::TransferDenseTable { table_id, name, value };
        if let Err(e) = call_with_retry(&joiner_addr, req).await {
            warn!(error = %e, table_id, joiner_id, "TransferDenseTable failed, giving up on this table");
        }
    }

    for table_id in node.sparse_table_ids() {
        let Some((name, dimension, element_type, init_spec)) = node.sparse_table_shell(table_id) else {
            continue;
        };
        let meta_req = RpcRequest::TransferSparseMetaData {
            table_id,
            name,
            dimension,
            element_type: element_type as u8,
            init_spec,
        };
        if let Err(e) = call_with_retry(&joiner_addr, meta_req).await {
            warn!(error = %e, table_id, joiner_id, "TransferSparseMetaData failed, giving up on this table");
            continue;
        }

        let Some(slot_count) = node.sparse_slot_count(table_id) else {
            continue;
        };
        for slot in 0..slot_count {
            let mut cursor = 0u64;
            loop {
                let batch = node.sparse_batch(table_id, slot, cursor, SPARSE_BATCH_SIZE);
                if batch.is_empty() {
                    break;
                }
                let next_cursor = batch.last().map(|(id, _)| id + 1).unwrap_or(cursor);
                let (sparse_ids, values): (Vec<u64>, Vec<DenseTensor>) = batch.into_iter().unzip();
                let batch_len = sparse_ids.len();
                let values_req = RpcRequest::TransferSparseValues { table_id, sparse_ids, values };
                if let Err(e) = call_with_retry(&joiner_addr, values_req).await {
                    warn!(error = %e, table_id, slot, joiner_id, "TransferSparseValues failed, giving up on this slot");
                    break;
                }
                if batch_len < SPARSE_BATCH_SIZE {
                    break;
                }
                cursor = next_cursor;
            }
        }
    }

    let finish_req = RpcRequest::NotifyFinishTransfer { donor_id: node.node_id };
    if let Err(e) = call_with_retry(&joiner_addr, finish_req).await {
        warn!(error = %e, joiner_id, "NotifyFinishTransfer failed");
    }

    node.drop_unowned_dense();
    for table_id in node.sparse_table_ids() {
        node.drop_unowned_sparse_rows(table_id);
    }
    node.finish_transfer();
}

/// Joiner-side proxy read-through for a dense table: on a local miss, try
/// each proxy predecessor in turn, installing the first value found.
pub async fn ensure_dense_present(node: &PsNode, table_id: u64) -> PsResult<()> {
    if node.has_dense(table_id) {
        return Ok(());
    }
    for predecessor in node.proxy_targets() {
        let Some(addr) = node.router().node(predecessor).map(|n| n.name.clone()) else {
            continue;
        };
        let req = RpcRequest::TryCombineFetchDenseTable { table_ids: vec![table_id] };
        if let Ok(RpcReply::TryCombineFetchDenseTable { found }) = call(&addr, req).await {
            if let Some((_, name, value)) = found.into_iter().next() {
                node.receive_dense(table_id, name, value)?;
                return Ok(());
            }
        }
    }
    Err(PsError::TableNotExist(table_id))
}

/// Joiner-side proxy read-through for sparse rows: fetch the shell (if the
/// table itself is still unknown here) and then the requested rows from
/// whichever predecessor has them.
pub async fn ensure_sparse_present(node: &PsNode, table_id: u64, sparse_ids: &[u64]) -> PsResult<()> {
    let missing: Vec<u64> = sparse_ids.iter().copied().filter(|&id| !node.has_sparse_row(table_id, id)).collect();
    if missing.is_empty() {
        return Ok(());
    }

    for predecessor in node.proxy_targets() {
        let Some(addr) = node.router().node(predecessor).map(|n| n.name.clone()) else {
            continue;
        };

        if !node.has_sparse_table(table_id) {
            let meta_req = RpcRequest::TryFetchSparseMetaData { table_id };
            if let Ok(RpcReply::TryFetchSparseMetaData { shell: Some((name, dimension, element_type, init_spec)) }) =
                call(&addr, meta_req).await
            {
                node.receive_sparse_meta(table_id, name, dimension, element_type_from_byte(element_type), init_spec)?;
            }
        }

        let values_req =
            RpcRequest::TryFetchSparseValues { table_id, sparse_ids: missing.clone() };
        if let Ok(RpcReply::TryFetchSparseValues { sparse_ids: found_ids, values }) = call(&addr, values_req).await {
            if !found_ids.is_empty() {
                node.receive_sparse_rows(table_id, &found_ids, &values)?;
            }
        }
    }
    Ok(())
}
