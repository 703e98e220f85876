//! Control-plane state and protocol for cluster membership, model
//! registration, and save/load orchestration.

mod cluster;
mod dispatch;
mod handler;

pub use cluster::{Cluster, JoinOutcome};
pub use dispatch::{
    broadcast_create_dense_table, broadcast_create_model, broadcast_create_sparse_table,
    broadcast_node_join, broadcast_trigger_load, broadcast_trigger_save, probe_alive, probe_heartbeat,
};
pub use handler::handle;
