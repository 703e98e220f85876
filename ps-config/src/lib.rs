//! CLI flag parsing and logging setup shared by `ps-scheduler-bin` and
//! `ps-node-bin`: the process-level concerns a training job never wants in
//! the library crates themselves.

use clap::Parser;

/// `ps-scheduler-bin`'s flags: just the port to listen on.
#[derive(Parser, Debug)]
#[command(author, version, about = "Parameter-server scheduler")]
pub struct SchedulerOptions {
    /// Port the scheduler listens on for TryJoin/FetchRouter/control-plane RPCs.
    #[arg(long, env = "PS_SCHEDULER_PORT", default_value_t = 50000)]
    pub port: u16,
}

/// `ps-node-bin`'s flags: this node's own address, where to find the
/// scheduler, and its checkpoint directory.
#[derive(Parser, Debug)]
#[command(author, version, about = "Parameter-server node")]
pub struct NodeOptions {
    /// Address this node listens on and advertises to the scheduler/peers.
    #[arg(long, env = "PS_NODE_ADDR")]
    pub addr: String,

    /// Address of the cluster's scheduler.
    #[arg(long, env = "PS_SCHEDULER_ADDR")]
    pub scheduler_addr: String,

    /// Directory snapshots are written under (one subdirectory per shard).
    #[arg(long, env = "PS_SAVE_DIR", default_value = "./ps-save")]
    pub save_dir: String,

    /// Newest snapshots to keep per shard before older ones are pruned.
    #[arg(long, env = "PS_MAX_SAVE_COUNT", default_value_t = 3)]
    pub max_save_count: usize,
}

/// Install a `tracing-subscriber` formatter honoring `RUST_LOG`, defaulting
/// to `info` when unset. Call once, at process start.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
