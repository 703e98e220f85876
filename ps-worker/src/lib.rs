//! Client-side router cache, request routing, and optional gradient
//! compression for training processes talking to the parameter server.

mod cache;
mod compress;
mod dispatch;
mod worker;

pub use cache::RouterCache;
pub use compress::{DctConfig, DenseBag};
pub use worker::Worker;
