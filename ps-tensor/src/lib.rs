//! A minimal, concrete tensor and optimizer-state runtime.
//!
//! The parameter server's table engine is specified against an external
//! tensor/numeric runtime (elementwise math, initializers, optimizer
//! arithmetic) that a real deployment would share with its training
//! framework. This crate supplies the smallest concrete implementation that
//! satisfies every operation the table engine and its optimizers actually
//! call, so the rest of the workspace has something real to compile and test
//! against, without pretending to be a general-purpose tensor library.

mod initializer;
mod tensor;
mod value;

pub use initializer::Initializer;
pub use tensor::{CooTensor, DenseTensor, ElementType, Tensor};
pub use value::{StateKind, Value};
