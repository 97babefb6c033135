//! Bidirectional relay pipe
//!
//! A pipe joins two byte streams and copies in both directions until either
//! side finishes. When one direction stops (EOF, error, or cancellation) the
//! stream it was writing to is shut down and the opposite direction is
//! stopped too, so neither end is left half-open.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use wh_core::traits::RelayStream;
use wh_core::types::PipeId;

/// Size of the copy buffer used by each relay direction.
///
/// Matches the maximum SSH packet payload most servers advertise, so one read
/// from a channel usually fits in one buffer.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on how long a relay direction waits for its writer to shut down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which way bytes travel through a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first stream to the second
    AToB,
    /// From the second stream to the first
    BToA,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

/// Outcome of a finished pipe
#[derive(Debug, Default)]
pub struct RelaySummary {
    /// Bytes copied from the first stream to the second
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first
    pub b_to_a: u64,
    /// First I/O error observed, if the pipe did not end cleanly
    pub error: Option<io::Error>,
}

impl RelaySummary {
    /// Total bytes moved in both directions
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }

    fn record(&mut self, direction: Direction, copied: u64, result: io::Result<()>) {
        match direction {
            Direction::AToB => self.a_to_b = copied,
            Direction::BToA => self.b_to_a = copied,
        }
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }
}

/// A single relay between two streams
pub struct RelayPipe {
    id: PipeId,
    cancel: CancellationToken,
}

impl RelayPipe {
    /// Create a pipe whose lifetime is bounded by `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            id: PipeId::next(),
            cancel: parent.child_token(),
        }
    }

    /// Identifier used in log lines
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Token that stops this pipe (and only this pipe) when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Copy bytes between `a` and `b` until either side finishes
    ///
    /// Both directions run as their own tasks. The returned summary is only
    /// produced after both have stopped and both writers have been shut down.
    pub async fn run<A, B>(self, a: A, b: B) -> RelaySummary
    where
        A: RelayStream,
        B: RelayStream,
    {
        let (a_reader, a_writer) = tokio::io::split(a);
        let (b_reader, b_writer) = tokio::io::split(b);

        let forward = tokio::spawn(pump(
            self.id,
            Direction::AToB,
            a_reader,
            b_writer,
            self.cancel.clone(),
        ));
        let backward = tokio::spawn(pump(
            self.id,
            Direction::BToA,
            b_reader,
            a_writer,
            self.cancel.clone(),
        ));

        let mut summary = RelaySummary::default();
        for (direction, joined) in [
            (Direction::AToB, forward.await),
            (Direction::BToA, backward.await),
        ] {
            match joined {
                Ok((copied, result)) => summary.record(direction, copied, result),
                Err(e) => {
                    tracing::error!("{} {} task failed: {}", self.id, direction, e);
                    summary.record(direction, 0, Err(io::Error::new(io::ErrorKind::Other, e)));
                }
            }
        }

        tracing::debug!(
            "{} finished: {} bytes a->b, {} bytes b->a",
            self.id,
            summary.a_to_b,
            summary.b_to_a
        );
        summary
    }
}

/// Copy one direction of a pipe
async fn pump<R, W>(
    id: PipeId,
    direction: Direction,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut copied = 0u64;

    let result = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            break Err(e);
        }
        copied += n as u64;
    };

    if let Err(e) = &result {
        tracing::debug!("{} {} stopped: {}", id, direction, e);
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!("{} {} shutdown failed: {}", id, direction, e),
        Err(_) => tracing::debug!("{} {} shutdown timed out", id, direction),
    }
    cancel.cancel();

    (copied, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn read_exactly<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(Duration::from_secs(5), reader.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf
    }

    #[tokio::test]
    async fn test_relay_preserves_order_in_both_directions() {
        let parent = CancellationToken::new();
        let (a_near, mut a_far) = duplex(64);
        let (b_near, mut b_far) = duplex(64);
        let pipe = tokio::spawn(RelayPipe::new(&parent).run(a_near, b_near));

        a_far.write_all(b"one ").await.unwrap();
        b_far.write_all(b"uno ").await.unwrap();
        a_far.write_all(b"two ").await.unwrap();
        b_far.write_all(b"dos ").await.unwrap();
        a_far.write_all(b"three").await.unwrap();
        b_far.write_all(b"tres").await.unwrap();

        assert_eq!(read_exactly(&mut b_far, 13).await, b"one two three");
        assert_eq!(read_exactly(&mut a_far, 12).await, b"uno dos tres");

        drop(a_far);
        let summary = tokio::time::timeout(Duration::from_secs(5), pipe)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.a_to_b, 13);
        assert_eq!(summary.b_to_a, 12);
        assert_eq!(summary.total(), 25);
    }

    #[tokio::test]
    async fn test_closing_a_closes_b() {
        let parent = CancellationToken::new();
        let (a_near, a_far) = duplex(64);
        let (b_near, mut b_far) = duplex(64);
        let pipe = tokio::spawn(RelayPipe::new(&parent).run(a_near, b_near));

        drop(a_far);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), b_far.read(&mut buf))
            .await
            .expect("b never saw EOF")
            .unwrap();
        assert_eq!(n, 0);

        let summary = tokio::time::timeout(Duration::from_secs(5), pipe)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total(), 0);
    }

    #[tokio::test]
    async fn test_closing_b_closes_a() {
        let parent = CancellationToken::new();
        let (a_near, mut a_far) = duplex(64);
        let (b_near, mut b_far) = duplex(64);
        let pipe = tokio::spawn(RelayPipe::new(&parent).run(a_near, b_near));

        b_far.write_all(b"bye").await.unwrap();
        assert_eq!(read_exactly(&mut a_far, 3).await, b"bye");
        drop(b_far);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), a_far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(tokio::time::timeout(Duration::from_secs(5), pipe).await.is_ok());
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_pipe() {
        let parent = CancellationToken::new();
        let (a_near, _a_far) = duplex(64);
        let (b_near, mut b_far) = duplex(64);
        let pipe = RelayPipe::new(&parent);
        let token = pipe.cancel_token();
        let task = tokio::spawn(pipe.run(a_near, b_near));

        parent.cancel();
        assert!(token.is_cancelled());

        let summary = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("pipe ignored cancellation")
            .unwrap();
        assert!(summary.error.is_none());

        let mut buf = [0u8; 1];
        assert_eq!(b_far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pipe_cancel_does_not_touch_parent() {
        let parent = CancellationToken::new();
        let pipe = RelayPipe::new(&parent);
        pipe.cancel_token().cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_large_transfer_crosses_buffer_boundary() {
        let parent = CancellationToken::new();
        let (a_near, mut a_far) = duplex(4096);
        let (b_near, mut b_far) = duplex(4096);
        let pipe = tokio::spawn(RelayPipe::new(&parent).run(a_near, b_near));

        let payload: Vec<u8> = (0..RELAY_BUFFER_SIZE * 3 + 17).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a_far.write_all(&payload).await.unwrap();
            a_far.shutdown().await.unwrap();
            a_far
        });

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), b_far.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let summary = pipe.await.unwrap();
        assert_eq!(summary.a_to_b, expected.len() as u64);
    }
}
