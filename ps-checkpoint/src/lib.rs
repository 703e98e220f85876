//! Checkpoint save/load: on-disk layout, background save queue, and
//! range-intersection reassembly across cluster sizes.
//!
//! `CheckpointExec`-equivalent is the only path this crate ships — no
//! duplicate saver implementations.

mod layout;
mod load;
mod model_meta;
mod prune;
mod queue;
mod record;
mod save;

pub use layout::{format_timestamp, shard_dir, snapshot_dir};
pub use load::{discover_shards, donors_for, latest_per_node, load_dense_tables, load_sparse_rows, read_model, read_router, ShardRef};
pub use model_meta::ModelMetaData;
pub use prune::prune_old_snapshots;
pub use queue::SaveQueue;
pub use record::{DenseRecord, SparseRecord, SparseSlot};
pub use save::write_snapshot;
