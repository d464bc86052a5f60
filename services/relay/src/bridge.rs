//! Bidirectional byte bridge with close-once semantics.
//!
//! Two copy loops run concurrently. Whichever direction stops first fires a
//! shared [`CloseOnce`] guard, which stops the other direction as well. Each
//! loop shuts down the write half it owns, so every endpoint is closed exactly
//! once, and [`bridge`] only returns after both loops have finished.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

/// Copy buffer size. Large enough that one packet read maps to one write.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a write-half shutdown once the bridge is closing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Copy direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a_to_b"),
            Direction::BToA => write!(f, "b_to_a"),
        }
    }
}

/// Result of a finished bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
    /// Direction that stopped first and triggered the close.
    pub first_closed: Direction,
}

/// One-shot close guard shared by both directions of a bridge.
///
/// Firing is idempotent. Only the first call to [`fire`](Self::fire) returns
/// `true`; every waiter on [`fired`](Self::fired) wakes once it has fired.
#[derive(Debug)]
pub struct CloseOnce {
    tx: watch::Sender<bool>,
}

impl CloseOnce {
    /// A guard that has not fired.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the guard. Returns `true` for the caller that fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the guard has fired.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CloseOnce {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge two duplex endpoints until either side stops.
pub async fn bridge<A, B>(a: A, b: B) -> BridgeStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let close = CloseOnce::new();

    let ((a_to_b, a_first), (b_to_a, _)) = tokio::join!(
        copy_until_closed(a_read, b_write, &close, Direction::AToB),
        copy_until_closed(b_read, a_write, &close, Direction::BToA),
    );

    let first_closed = if a_first {
        Direction::AToB
    } else {
        Direction::BToA
    };

    debug!(a_to_b, b_to_a, first_closed = %first_closed, "Bridge closed");

    BridgeStats {
        a_to_b,
        b_to_a,
        first_closed,
    }
}

/// Copy `reader` into `writer` until EOF, an I/O error, or the guard fires.
///
/// Returns the bytes copied and whether this direction fired the guard.
async fn copy_until_closed<R, W>(
    mut reader: R,
    mut writer: W,
    close: &CloseOnce,
    direction: Direction,
) -> (u64, bool)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = close.fired() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(%direction, error = %e, "Bridge read failed");
                    break;
                }
            },
        };

        let written = tokio::select! {
            biased;
            _ = close.fired() => break,
            // Buffered writers hold bytes until flushed.
            result = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => result,
        };
        if let Err(e) = written {
            debug!(%direction, error = %e, "Bridge write failed");
            break;
        }
        total += n as u64;
    }

    let first = close.fire();

    // The peer may already have closed its side.
    let _ = timeout(SHUTDOWN_GRACE, writer.shutdown()).await;

    (total, first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};
    use tokio::sync::mpsc;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Message-oriented endpoint: each read yields one queued packet and each
    /// write is recorded as one packet.
    struct PacketEndpoint {
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncRead for PacketEndpoint {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(packet)) => {
                    buf.put_slice(&packet);
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(None) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            }
        }
    }

    impl AsyncWrite for PacketEndpoint {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.written.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    type Captured = Arc<Mutex<Vec<Vec<u8>>>>;

    fn packet_endpoint() -> (PacketEndpoint, mpsc::UnboundedSender<Vec<u8>>, Captured) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let endpoint = PacketEndpoint {
            incoming,
            written: Arc::clone(&written),
        };
        (endpoint, tx, written)
    }

    #[tokio::test]
    async fn test_bridge_copies_both_directions() {
        let (a, mut a_peer) = duplex(1024);
        let (b, mut b_peer) = duplex(1024);

        let handle = tokio::spawn(bridge(a, b));

        a_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        a_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(a_peer);

        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 4);
        assert_eq!(stats.b_to_a, 5);
        assert_eq!(stats.first_closed, Direction::AToB);

        // b was shut down by the bridge
        let mut rest = Vec::new();
        b_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_buffered_writer_is_flushed() {
        let (a, mut a_peer) = duplex(1024);
        let (b, mut b_peer) = duplex(1024);

        let _handle = tokio::spawn(bridge(a, tokio::io::BufWriter::new(b)));

        // Keep the session open; only a flush can deliver the bytes.
        a_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(TEST_TIMEOUT, b_peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_failed_read_closes_other_side() {
        let a = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (b, mut b_peer) = duplex(1024);

        let stats = timeout(TEST_TIMEOUT, bridge(a, b)).await.unwrap();
        assert_eq!(stats.first_closed, Direction::AToB);
        assert_eq!(stats.a_to_b, 0);
        assert_eq!(stats.b_to_a, 0);

        // Both directions have ended; b's peer sees EOF.
        let mut rest = Vec::new();
        b_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_both_ends_close_together() {
        let (a, a_peer) = duplex(1024);
        let (b, b_peer) = duplex(1024);

        let handle = tokio::spawn(bridge(a, b));
        drop(a_peer);
        drop(b_peer);

        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        assert_eq!(stats.a_to_b, 0);
        assert_eq!(stats.b_to_a, 0);
    }

    #[tokio::test]
    async fn test_packet_boundaries_preserved() {
        let (a, a_tx, _a_written) = packet_endpoint();
        let (b, b_tx, b_written) = packet_endpoint();

        a_tx.send(vec![1u8; 1500]).unwrap();
        a_tx.send(vec![2u8; 40]).unwrap();
        a_tx.send(vec![3u8; 9000]).unwrap();

        let handle = tokio::spawn(bridge(a, b));

        // Let the packets flow before closing a.
        for _ in 0..100 {
            if b_written.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(a_tx);

        let stats = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
        drop(b_tx);

        let packets = b_written.lock().unwrap().clone();
        let sizes: Vec<usize> = packets.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1500, 40, 9000]);
        assert_eq!(stats.a_to_b, 1500 + 40 + 9000);
    }

    #[tokio::test]
    async fn test_close_once_fires_once() {
        let close = Arc::new(CloseOnce::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let close = Arc::clone(&close);
            handles.push(tokio::spawn(async move { close.fire() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(close.is_fired());
        timeout(TEST_TIMEOUT, close.fired()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_once_wakes_waiters() {
        let close = Arc::new(CloseOnce::new());
        let waiter = {
            let close = Arc::clone(&close);
            tokio::spawn(async move { close.fired().await })
        };

        tokio::task::yield_now().await;
        assert!(!close.is_fired());
        assert!(close.fire());
        assert!(!close.fire());

        timeout(TEST_TIMEOUT, waiter).await.unwrap().unwrap();
    }
}
