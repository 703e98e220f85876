//! Scheduler process entry point: bind the control-plane listener, answer
//! every `RpcRequest` the cluster understands, and poll each known node's
//! heartbeat on a timer so `IsAllPsWorking` stays current.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ps_config::SchedulerOptions;
use ps_scheduler::Cluster;
use ps_wire::{CompressKind, RequestFrame};
use tokio::net::TcpListener;
use tracing::{info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ps_config::init_tracing();
    let opts = SchedulerOptions::parse();

    let addr = format!("0.0.0.0:{}", opts.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "scheduler listening");

    let cluster = Arc::new(Cluster::new());

    let heartbeat_cluster = Arc::clone(&cluster);
    tokio::spawn(async move {
        heartbeat_loop(heartbeat_cluster).await;
    });

    let serve_cluster = Arc::clone(&cluster);
    let serve = tokio::spawn(async move {
        ps_wire::serve(listener, move |frame: RequestFrame| {
            let cluster = Arc::clone(&serve_cluster);
            async move { answer(&cluster, frame).await }
        })
        .await
    });

    tokio::select! {
        res = serve => {
            if let Err(e) = res? {
                warn!(error = %e, "scheduler listener stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down on ctrl-c");
        }
    }
    Ok(())
}

async fn answer(cluster: &Arc<Cluster>, frame: RequestFrame) -> ps_wire::ReplyFrame {
    let timestamp = frame.header.timestamp;
    match ps_wire::decode_request(&frame) {
        Ok(req) => match ps_scheduler::handle(cluster, req).await {
            Ok(reply) => ps_wire::encode_reply(timestamp, &reply, CompressKind::None)
                .unwrap_or_else(|e| ps_wire::encode_error_reply(timestamp, &e)),
            Err(e) => ps_wire::encode_error_reply(timestamp, &e),
        },
        Err(e) => ps_wire::encode_error_reply(timestamp, &e),
    }
}

async fn heartbeat_loop(cluster: Arc<Cluster>) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        for (node_id, addr) in cluster.node_addrs() {
            match ps_scheduler::probe_heartbeat(&addr).await {
                Ok(status) => cluster.record_heartbeat(node_id, status),
                Err(e) => warn!(error = %e, node_id, %addr, "heartbeat probe failed"),
            }
        }
    }
}
