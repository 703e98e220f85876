//! Server-side connection handling: accept a TCP connection, decode tagged
//! request frames, dispatch each to a handler concurrently, and write
//! tagged replies back in whatever order they complete — the mirror image
//! of `transport::PsTransport` on the client side.

use std::future::Future;

use async_bincode::tokio::{AsyncBincodeStream, AsyncDestination};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::{ReplyFrame, RequestFrame, Tagged};

type PsServerTransport =
    AsyncBincodeStream<TcpStream, Tagged<RequestFrame>, Tagged<ReplyFrame>, AsyncDestination>;

/// Read tagged requests off `stream`, run each through `handler`
/// concurrently, and write tagged replies back as they finish. One request
/// stalling (a slow sparse pull, say) never blocks the others on the same
/// connection.
pub async fn serve_connection<F, Fut>(stream: TcpStream, handler: F) -> std::io::Result<()>
where
    F: Fn(RequestFrame) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ReplyFrame> + Send + 'static,
{
    stream.set_nodelay(true)?;
    let transport: PsServerTransport = AsyncBincodeStream::from(stream).for_async();
    let (mut sink, mut stream) = transport.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Tagged<ReplyFrame>>();

    let recv = async move {
        while let Some(frame) = stream.next().await {
            let Tagged { tag, v } = match frame {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "connection read failed, closing");
                    break;
                }
            };
            let handler = handler.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let reply = handler(v).await;
                let _ = tx.send(Tagged { tag, v: reply });
            });
        }
    };
    let send = async move {
        while let Some(tagged) = rx.recv().await {
            if sink.send(tagged).await.is_err() {
                break;
            }
        }
    };
    tokio::join!(recv, send);
    Ok(())
}

/// Accept connections on `listener` forever, spawning one task per
/// connection. Returns only on a fatal accept error.
pub async fn serve<F, Fut>(listener: TcpListener, handler: F) -> std::io::Result<()>
where
    F: Fn(RequestFrame) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ReplyFrame> + Send + 'static,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler).await {
                error!(error = %e, %peer, "connection handling failed");
            }
        });
    }
}
