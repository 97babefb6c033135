//! Shared forwarded channel
//!
//! In shared mode one `forwarded-tcpip` channel carries the bytes of every
//! connection the gateway accepts for a tunnel. The hub owns that channel and
//! hands out [`ChannelPort`]s; each relay pipe uses one port as its second
//! stream. Writes from all ports are queued onto the channel in the order
//! they complete. Reads are served chunk by chunk to whichever port asks
//! first.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::{CancellationToken, PollSender};

use wh_core::traits::RelayStream;
use wh_core::types::TunnelId;

use crate::relay::RELAY_BUFFER_SIZE;

/// Chunks buffered in each direction between the channel and its ports
const CHANNEL_QUEUE_DEPTH: usize = 64;

/// Owner of a tunnel's single forwarded channel
pub struct SharedChannel {
    outbound: mpsc::Sender<Bytes>,
    inbound: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    closed: CancellationToken,
    task: JoinHandle<()>,
}

impl SharedChannel {
    /// Take ownership of `stream` and start moving bytes through it
    ///
    /// The hub stops when the channel reaches EOF, fails, or `cancel` fires.
    pub fn spawn<S: RelayStream>(tunnel: TunnelId, stream: S, cancel: &CancellationToken) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
        let closed = cancel.child_token();

        let task = tokio::spawn(run_hub(tunnel, stream, outbound_rx, inbound_tx, closed.clone()));

        Self {
            outbound,
            inbound: Arc::new(Mutex::new(inbound)),
            closed,
            task,
        }
    }

    /// A new stream view onto the channel
    pub fn port(&self) -> ChannelPort {
        let inbound = Arc::clone(&self.inbound);
        let chunks: BoxStream<'static, io::Result<Bytes>> =
            futures::stream::unfold(inbound, |inbound| async move {
                let chunk = inbound.lock().await.recv().await;
                chunk.map(|chunk| (Ok(chunk), inbound))
            })
            .boxed();

        ChannelPort {
            reader: StreamReader::new(chunks),
            writer: PollSender::new(self.outbound.clone()),
        }
    }

    /// Resolves once the channel is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Stop the hub and wait for it to release the channel
    pub async fn shutdown(self) {
        self.closed.cancel();
        drop(self.outbound);
        if let Err(e) = self.task.await {
            tracing::error!("Shared channel task failed: {}", e);
        }
    }
}

async fn run_hub<S: RelayStream>(
    tunnel: TunnelId,
    stream: S,
    mut outbound: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let read_side = async {
        let mut buf = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
        loop {
            buf.reserve(RELAY_BUFFER_SIZE);
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("{} forwarded channel reached EOF", tunnel);
                    break;
                }
                Ok(_) => {
                    if inbound.send(buf.split().freeze()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("{} forwarded channel read failed: {}", tunnel, e);
                    break;
                }
            }
        }
    };

    let write_side = async {
        while let Some(chunk) = outbound.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                tracing::warn!("{} forwarded channel write failed: {}", tunnel, e);
                break;
            }
        }
    };

    tokio::select! {
        _ = closed.cancelled() => {}
        _ = read_side => {}
        _ = write_side => {}
    }

    let _ = writer.shutdown().await;
    closed.cancel();
}

/// One pipe's view of a [`SharedChannel`]
///
/// Shutting a port down only stops that port's writes; the channel itself
/// stays open for the other pipes.
pub struct ChannelPort {
    reader: StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>,
    writer: PollSender<Bytes>,
}

fn channel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "forwarded channel closed")
}

impl AsyncRead for ChannelPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = &mut *self;
        ready!(this.writer.poll_reserve(cx)).map_err(|_| channel_gone())?;
        this.writer
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| channel_gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.writer.close();
        Poll::Ready(Ok(()))
    }
}
