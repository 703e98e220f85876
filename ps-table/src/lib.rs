//! The sharded in-memory table engine: dense and sparse tables, their
//! optimizers, and the per-slot locked ordered map backing sparse rows.

mod dense;
mod optim;
mod slotmap;
mod sparse;

pub use dense::DenseTable;
pub use optim::Optimizer;
pub use slotmap::{SlottedMap, SLOT_COUNT};
pub use sparse::SparseTable;
