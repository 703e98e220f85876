//! Client-side transport: one `tokio_tower::multiplex` connection per pool
//! slot, load-balanced, buffered, and concurrency-limited, mirroring
//! `readyset-client/src/table.rs`'s `Endpoint` / `TableRpc` construction.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_bincode::tokio::{AsyncBincodeStream, AsyncDestination};
use futures_util::stream::FuturesUnordered;
use futures_util::Stream;
use tokio::io::AsyncWriteExt;
use tower::balance::p2c::Balance;
use tower::buffer::Buffer;
use tower::limit::concurrency::ConcurrencyLimit;
use tower::timeout::Timeout;
use tower_service::Service;
use tracing::error;

use crate::{ReplyFrame, RequestFrame, Tagged, Tagger};

/// Every outbound RPC fails fast after this long with no retry at this
/// layer (higher layers, e.g. the join/transfer loops, retry on top of it).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(5000);

/// How many parallel connections a client pool opens to one peer address,
/// so sharded/combine-pull requests to the same node don't serialize behind
/// one TCP connection.
const CONN_POOL_SIZE: usize = 4;

/// The framed value actually carried by `tokio_tower`: a header plus an
/// already-(de)compressed bincode body (see `crate::header`).
pub type PsTransport = AsyncBincodeStream<
    tokio::net::TcpStream,
    Tagged<ReplyFrame>,
    Tagged<RequestFrame>,
    AsyncDestination,
>;

type InnerService = tokio_tower::multiplex::Client<
    tokio_tower::multiplex::MultiplexTransport<PsTransport, Tagger>,
    tokio_tower::Error<tokio_tower::multiplex::MultiplexTransport<PsTransport, Tagger>, Tagged<RequestFrame>>,
    Tagged<RequestFrame>,
>;

type Discover = Pin<
    Box<dyn Stream<Item = Result<tower::discover::Change<usize, InnerService>, std::io::Error>> + Send>,
>;

/// The client-visible service type every caller (scheduler client, node
/// client, worker client) sends `Tagged<RequestFrame>` into.
pub type ClientService =
    Timeout<Buffer<ConcurrencyLimit<Balance<Discover, Tagged<RequestFrame>>>, Tagged<RequestFrame>>>;

#[derive(Debug)]
struct Endpoint {
    addr: SocketAddr,
}

impl Service<()> for Endpoint {
    type Response = InnerService;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: ()) -> Self::Future {
        let addr = self.addr;
        Box::pin(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            stream.flush().await?;
            let transport: PsTransport = AsyncBincodeStream::from(stream).for_async();
            let multiplexed =
                tokio_tower::multiplex::MultiplexTransport::new(transport, Tagger::default());
            Ok(tokio_tower::multiplex::Client::with_error_handler(
                multiplexed,
                move |e| error!(error = %e, peer = %addr, "parameter-server connection lost"),
            ))
        })
    }
}

fn discover(addr: SocketAddr) -> Discover {
    Box::pin(
        (0..CONN_POOL_SIZE)
            .map(move |slot| async move {
                let svc = Endpoint { addr }.call(()).await?;
                Ok(tower::discover::Change::Insert(slot, svc))
            })
            .collect::<FuturesUnordered<_>>(),
    ) as Discover
}

/// Build a client-side service handle to `addr`. Safe to clone and share:
/// the `Buffer` runs its worker task on the current Tokio runtime and hands
/// back a cheap handle.
pub fn client_service(addr: SocketAddr) -> ClientService {
    let balanced = Balance::new(discover(addr));
    let limited = ConcurrencyLimit::new(balanced, CONN_POOL_SIZE * 32);
    let buffered = Buffer::new(limited, CONN_POOL_SIZE * 32);
    Timeout::new(buffered, DEFAULT_RPC_TIMEOUT)
}
