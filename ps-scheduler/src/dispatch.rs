//! Fan `Cluster`'s decisions out to nodes over the wire. Kept separate from
//! `cluster.rs` so the state machine itself stays pure and unit-testable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ps_errors::{PsError, PsResult};
use ps_router::Router;
use ps_tensor::{DenseTensor, ElementType, Initializer};
use ps_wire::{client_service, CompressKind, ModelMetaData, OptimConfig, RpcReply, RpcRequest, Tagged};
use tower_service::Service;
use tracing::warn;

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

/// Notify every incumbent of a new router (the joiner is excluded: it
/// learns the new router from its own `TryJoin` reply). Donors discover
/// themselves inside the handler on the node side, from the router diff;
/// this call doesn't need to know who the donors are.
pub async fn broadcast_node_join(node_addrs: &HashMap<u64, String>, joiner_id: u64, new_router: &Router) {
    for (&id, addr) in node_addrs {
        if id == joiner_id {
            continue;
        }
        let req = RpcRequest::NotifyNodeJoin { router: new_router.clone() };
        if let Err(e) = call(addr, req).await {
            warn!(error = %e, node_id = id, "NotifyNodeJoin fan-out failed");
        }
    }
}

pub async fn broadcast_create_model(node_addrs: &HashMap<u64, String>, name: &str, optim: &OptimConfig) {
    for addr in node_addrs.values() {
        let req = RpcRequest::CreateModel { name: name.to_string(), optim: optim.clone() };
        if let Err(e) = call(addr, req).await {
            warn!(error = %e, "CreateModel fan-out failed");
        }
    }
}

pub async fn broadcast_create_dense_table(
    node_addrs: &HashMap<u64, String>,
    table_id: u64,
    name: &str,
    val_template: &DenseTensor,
) {
    for addr in node_addrs.values() {
        let req = RpcRequest::CreateDenseTable {
            table_id,
            name: name.to_string(),
            val_template: val_template.clone(),
        };
        if let Err(e) = call(addr, req).await {
            warn!(error = %e, "CreateDenseTable fan-out failed");
        }
    }
}

pub async fn broadcast_create_sparse_table(
    node_addrs: &HashMap<u64, String>,
    table_id: u64,
    name: &str,
    dimension: u64,
    element_type: ElementType,
    init_spec: &Initializer,
) {
    for addr in node_addrs.values() {
        let req = RpcRequest::CreateSparseTable {
            table_id,
            name: name.to_string(),
            dimension,
            element_type: element_type as u8,
            init_spec: init_spec.clone(),
        };
        if let Err(e) = call(addr, req).await {
            warn!(error = %e, "CreateSparseTable fan-out failed");
        }
    }
}

/// Trigger a background snapshot write on every node, all labeled with the
/// same `timestamp` so one save round produces one shard set.
pub async fn broadcast_trigger_save(node_addrs: &HashMap<u64, String>, timestamp: &str) {
    for (&id, addr) in node_addrs {
        let req = RpcRequest::TriggerSave { timestamp: timestamp.to_string() };
        if let Err(e) = call(addr, req).await {
            warn!(error = %e, node_id = id, "TriggerSave fan-out failed");
        }
    }
}

/// Trigger a load on every node, returning the first recovered model
/// metadata any of them reports. Every node reads the same snapshot set
/// under its own save directory, so one copy is enough to restore the
/// scheduler's own bookkeeping.
pub async fn broadcast_trigger_load(node_addrs: &HashMap<u64, String>) -> Option<ModelMetaData> {
    let mut recovered = None;
    for (&id, addr) in node_addrs {
        match call(addr, RpcRequest::TriggerLoad).await {
            Ok(RpcReply::TriggerLoad { mdata }) => {
                if recovered.is_none() {
                    recovered = mdata;
                }
            }
            Ok(other) => warn!(node_id = id, reply = ?other, "unexpected TriggerLoad reply"),
            Err(e) => warn!(error = %e, node_id = id, "TriggerLoad fan-out failed"),
        }
    }
    recovered
}

/// Probes a node's liveness by asking for its router, independent of the
/// node's own periodic unsolicited `Heartbeat` push (that one flows node ->
/// scheduler; this flows the other way, for the scheduler's own timer).
pub async fn probe_alive(addr: &str) -> bool {
    call(addr, RpcRequest::FetchRouter).await.is_ok()
}

/// Ask a node for its current status bits. Driven by the scheduler's own
/// periodic heartbeat timer, feeding `Cluster::record_heartbeat`; this is
/// the only path that keeps `is_all_ps_working` current.
pub async fn probe_heartbeat(addr: &str) -> PsResult<u8> {
    match call(addr, RpcRequest::Heartbeat).await? {
        RpcReply::Heartbeat { status } => Ok(status),
        other => Err(PsError::Internal(format!("expected a Heartbeat reply, got {other:?}"))),
    }
}
