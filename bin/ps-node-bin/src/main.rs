//! Node process entry point: join the cluster (retrying per
//! `ps_util::retry::join_backoff`), build the in-memory model from whatever
//! metadata the scheduler already has, and serve `RpcRequest`s until told
//! to stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use ps_config::NodeOptions;
use ps_errors::{PsError, PsResult};
use ps_node::PsNode;
use ps_wire::{client_service, CompressKind, RequestFrame, RpcReply, RpcRequest, Tagged};
use tokio::net::TcpListener;
use tower_service::Service;
use tracing::{info, warn};

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

async fn join(scheduler_addr: &str, my_addr: &str, save_dir: PathBuf, max_save_count: usize) -> Arc<PsNode> {
    let backoff = ps_util::retry::join_backoff();
    loop {
        for wait in &backoff {
            match call(scheduler_addr, RpcRequest::TryJoin { addr: my_addr.to_string() }).await {
                Ok(RpcReply::TryJoin { node_id, old_router, new_router, model_mdata, .. }) => {
                    let incumbents_present = !old_router.is_empty();
                    let node = PsNode::new(node_id, my_addr.to_string(), new_router, incumbents_present)
                        .with_checkpoint_config(save_dir.clone(), max_save_count);
                    let node = Arc::new(node);
                    if incumbents_present {
                        let set = node.compute_proxy_set(&old_router);
                        node.set_proxy_set(set);
                    }
                    if let Some(mdata) = model_mdata {
                        if let Err(e) = node.create_model(mdata.name, mdata.optim) {
                            warn!(error = %e, "join reported a model but this node already has one");
                        }
                    }
                    info!(node_id, "joined cluster");
                    return node;
                }
                Ok(other) => warn!(reply = ?other, "unexpected TryJoin reply, retrying"),
                Err(e) => warn!(error = %e, "TryJoin failed, retrying"),
            }
            match wait {
                Some(d) => tokio::time::sleep(d).await,
                None => break,
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ps_config::init_tracing();
    let opts = NodeOptions::parse();

    let node = join(&opts.scheduler_addr, &opts.addr, PathBuf::from(&opts.save_dir), opts.max_save_count).await;

    let listener = TcpListener::bind(&opts.addr).await?;
    info!(addr = %opts.addr, "node listening");

    let serve_node = Arc::clone(&node);
    let serve = tokio::spawn(async move {
        ps_wire::serve(listener, move |frame: RequestFrame| {
            let node = Arc::clone(&serve_node);
            async move { answer(&node, frame).await }
        })
        .await
    });

    tokio::select! {
        res = serve => {
            if let Err(e) = res? {
                warn!(error = %e, "node listener stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down on ctrl-c");
        }
    }
    Ok(())
}

async fn answer(node: &Arc<PsNode>, frame: RequestFrame) -> ps_wire::ReplyFrame {
    let timestamp = frame.header.timestamp;
    match ps_wire::decode_request(&frame) {
        Ok(req) => match ps_node::handle(node, req).await {
            Ok(reply) => ps_wire::encode_reply(timestamp, &reply, CompressKind::None)
                .unwrap_or_else(|e| ps_wire::encode_error_reply(timestamp, &e)),
            Err(e) => ps_wire::encode_error_reply(timestamp, &e),
        },
        Err(e) => ps_wire::encode_error_reply(timestamp, &e),
    }
}
