//! Length-prefixed bincode framing, the RPC catalogue, and the client/server
//! transport stack shared by the scheduler, nodes, and workers.
//!
//! Grounded in `readyset-client/src/table.rs`'s `AsyncBincodeStream` +
//! `tokio_tower::multiplex` + `tower::balance`/`Buffer`/`ConcurrencyLimit`
//! client construction; the header/compression framing itself has no direct
//! analogue there and is built from scratch against the described format.

mod header;
mod rpc;
mod server;
mod tagged;
mod transport;

pub use header::{
    decode_reply, decode_request, encode_error_reply, encode_reply, encode_request, CompressKind,
    ReplyFrame, ReplyHeader, RequestFrame, RequestHeader,
};
pub use rpc::{ModelMetaData, OptimConfig, RpcKind, RpcReply, RpcRequest};
pub use server::{serve, serve_connection};
pub use tagged::{Tagged, Tagger};
pub use transport::{client_service, ClientService, PsTransport, DEFAULT_RPC_TIMEOUT};
