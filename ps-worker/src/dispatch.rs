//! One-shot RPC call helper, mirroring `ps_scheduler::dispatch`'s client
//! stack (same `client_service`/`encode_request`/`decode_reply` trio) but
//! kept local: a worker has no cluster state of its own to fan requests out
//! of, just individual calls to whichever node currently owns a key.

use std::sync::atomic::{AtomicU64, Ordering};

use ps_errors::{PsError, PsResult};
use ps_wire::{client_service, CompressKind, RpcReply, RpcRequest, Tagged};
use tower_service::Service;

static NEXT_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

pub(crate) async fn call(addr: &str, req: RpcRequest) -> PsResult<RpcReply> {
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
