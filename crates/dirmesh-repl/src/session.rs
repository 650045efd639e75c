//! Session transport: a bidirectional typed-message channel between a
//! replica and a replication server.
//!
//! The broker only depends on the [`ReplicationSession`] trait; the TCP
//! implementation carries length-prefixed bincode frames, and an in-memory
//! implementation backs unit tests and harnesses.

use crate::error::{ReplError, Result};
use async_trait::async_trait;
use dirmesh_protocol::messages::{decode_body, encode_frame, MAX_FRAME_SIZE};
use dirmesh_protocol::{ProtocolError, ReplicationMsg};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

/// A bidirectional typed-message channel with read timeout and close
/// semantics.
///
/// Messages published on one side arrive on the other in publish order;
/// ordering across different sessions is not guaranteed.
#[async_trait]
pub trait ReplicationSession: Send + Sync {
    /// Sends one message to the peer.
    async fn publish(&self, msg: &ReplicationMsg) -> Result<()>;

    /// Receives the next message, waiting at most `timeout`.
    ///
    /// Returns [`ReplError::Timeout`] when the deadline elapses and
    /// [`ReplError::SessionClosed`] once either side closed the session.
    async fn receive(&self, timeout: Duration) -> Result<ReplicationMsg>;

    /// Closes the session; pending and future operations fail with
    /// [`ReplError::SessionClosed`].
    fn close(&self);

    /// Returns true once the session has been closed locally.
    fn is_closed(&self) -> bool;

    /// Returns true when the transport negotiated encryption for this
    /// session. The built-in transports are plaintext; encrypting
    /// transports override this.
    fn is_encrypted(&self) -> bool {
        false
    }

    /// Time elapsed since the last message (of any kind) was received.
    fn last_receive_elapsed(&self) -> Duration;

    /// Human-readable peer address, for logging.
    fn peer(&self) -> &str;
}

/// Establishes sessions from candidate server addresses.
///
/// Abstracting the dialer keeps the broker testable against in-memory
/// servers.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Opens a session to `addr`, waiting at most `timeout` for the
    /// connection to establish.
    async fn connect(&self, addr: &str, timeout: Duration)
        -> Result<Arc<dyn ReplicationSession>>;
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Tracks the instant of the most recent receive without a lock.
#[derive(Debug)]
struct ReceiveClock {
    created: Instant,
    last_receive_ms: AtomicU64,
}

impl ReceiveClock {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            last_receive_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_receive_ms
            .store(millis(self.created.elapsed()), Ordering::Release);
    }

    fn elapsed(&self) -> Duration {
        let now = millis(self.created.elapsed());
        let last = self.last_receive_ms.load(Ordering::Acquire);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// TCP session carrying length-prefixed bincode frames.
pub struct TcpSession {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    closed_tx: watch::Sender<bool>,
    clock: ReceiveClock,
    peer_addr: String,
}

impl TcpSession {
    /// Wraps an established TCP stream into a session.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read, write) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
            closed_tx,
            clock: ReceiveClock::new(),
            peer_addr,
        }
    }

    async fn read_frame(read: &mut OwnedReadHalf) -> Result<ReplicationMsg> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = read.read_exact(&mut len_buf).await {
            return Err(map_eof(e));
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        let mut body = vec![0u8; len];
        if let Err(e) = read.read_exact(&mut body).await {
            return Err(map_eof(e));
        }
        Ok(decode_body(&body)?)
    }
}

fn map_eof(e: std::io::Error) -> ReplError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ReplError::SessionClosed
    } else {
        ReplError::Io(e)
    }
}

#[async_trait]
impl ReplicationSession for TcpSession {
    async fn publish(&self, msg: &ReplicationMsg) -> Result<()> {
        if self.is_closed() {
            return Err(ReplError::SessionClosed);
        }
        let frame = encode_frame(msg)?;
        let mut write = self.write.lock().await;
        write.write_all(&frame).await?;
        write.flush().await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<ReplicationMsg> {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut read = self.read.lock().await;
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => Err(ReplError::SessionClosed),
            res = tokio::time::timeout(timeout, Self::read_frame(&mut read)) => match res {
                Err(_) => Err(ReplError::Timeout("session read")),
                Ok(Ok(msg)) => {
                    self.clock.touch();
                    Ok(msg)
                }
                Ok(Err(e)) => Err(e),
            }
        }
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn last_receive_elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    fn peer(&self) -> &str {
        &self.peer_addr
    }
}

/// Dials replication servers over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Whether to set TCP_NODELAY on new connections.
    pub nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn ReplicationSession>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ReplError::Timeout("connect"))??;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr, "session connected");
        Ok(Arc::new(TcpSession::from_stream(stream)))
    }
}

/// In-memory session backed by message channels, for tests and harnesses.
pub struct MemorySession {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<ReplicationMsg>>>,
    rx: Mutex<mpsc::UnboundedReceiver<ReplicationMsg>>,
    closed_tx: watch::Sender<bool>,
    clock: ReceiveClock,
    peer_addr: String,
}

impl MemorySession {
    /// Creates a connected pair of sessions named after their peers.
    pub fn pair(left_name: &str, right_name: &str) -> (Arc<MemorySession>, Arc<MemorySession>) {
        let (to_right, from_left) = mpsc::unbounded_channel();
        let (to_left, from_right) = mpsc::unbounded_channel();
        let left = Arc::new(MemorySession {
            tx: std::sync::Mutex::new(Some(to_right)),
            rx: Mutex::new(from_right),
            closed_tx: watch::channel(false).0,
            clock: ReceiveClock::new(),
            peer_addr: right_name.to_string(),
        });
        let right = Arc::new(MemorySession {
            tx: std::sync::Mutex::new(Some(to_left)),
            rx: Mutex::new(from_left),
            closed_tx: watch::channel(false).0,
            clock: ReceiveClock::new(),
            peer_addr: left_name.to_string(),
        });
        (left, right)
    }
}

#[async_trait]
impl ReplicationSession for MemorySession {
    async fn publish(&self, msg: &ReplicationMsg) -> Result<()> {
        let guard = self.tx.lock().expect("session sender lock");
        match guard.as_ref() {
            Some(tx) => tx
                .send(msg.clone())
                .map_err(|_| ReplError::SessionClosed),
            None => Err(ReplError::SessionClosed),
        }
    }

    async fn receive(&self, timeout: Duration) -> Result<ReplicationMsg> {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => Err(ReplError::SessionClosed),
            res = tokio::time::timeout(timeout, rx.recv()) => match res {
                Err(_) => Err(ReplError::Timeout("session read")),
                Ok(Some(msg)) => {
                    self.clock.touch();
                    Ok(msg)
                }
                Ok(None) => Err(ReplError::SessionClosed),
            }
        }
    }

    fn close(&self) {
        let _ = self.closed_tx.send(true);
        // Dropping the sender lets the peer observe the closure.
        self.tx.lock().expect("session sender lock").take();
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn last_receive_elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    fn peer(&self) -> &str {
        &self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmesh_protocol::{Csn, UpdateMsg};

    #[tokio::test]
    async fn memory_pair_delivers_in_order() {
        let (a, b) = MemorySession::pair("a", "b");
        for i in 0..5u64 {
            a.publish(&ReplicationMsg::Update(UpdateMsg::new(
                Csn::new(i, 0, 1),
                vec![],
            )))
            .await
            .unwrap();
        }
        for i in 0..5u64 {
            match b.receive(Duration::from_millis(100)).await.unwrap() {
                ReplicationMsg::Update(u) => assert_eq!(u.csn.time_ms, i),
                other => panic!("unexpected {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn memory_receive_times_out() {
        let (_a, b) = MemorySession::pair("a", "b");
        let err = b.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ReplError::Timeout(_)));
    }

    #[tokio::test]
    async fn closing_wakes_a_blocked_receiver() {
        let (a, b) = MemorySession::pair("a", "b");
        let receiver = tokio::spawn(async move { b.receive(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close();
        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, ReplError::SessionClosed));
    }

    #[tokio::test]
    async fn close_is_observed_locally() {
        let (a, _b) = MemorySession::pair("a", "b");
        assert!(!a.is_closed());
        a.close();
        assert!(a.is_closed());
        let err = a
            .publish(&ReplicationMsg::Heartbeat)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::SessionClosed));
    }

    #[tokio::test]
    async fn tcp_session_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let session = TcpSession::from_stream(stream);
            let msg = session.receive(Duration::from_secs(5)).await.unwrap();
            assert_eq!(msg.kind(), "heartbeat");
            session.publish(&ReplicationMsg::Window { num_ack: 7 }).await.unwrap();
        });

        let connector = TcpConnector::default();
        let session = connector
            .connect(&addr, Duration::from_millis(500))
            .await
            .unwrap();
        session.publish(&ReplicationMsg::Heartbeat).await.unwrap();
        match session.receive(Duration::from_secs(5)).await.unwrap() {
            ReplicationMsg::Window { num_ack } => assert_eq!(num_ack, 7),
            other => panic!("unexpected {}", other.kind()),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_connect_times_out_on_dead_address() {
        let connector = TcpConnector::default();
        // RFC 5737 TEST-NET address: connect attempts hang or fail fast.
        let res = connector
            .connect("192.0.2.1:4444", Duration::from_millis(50))
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn last_receive_tracking() {
        let (a, b) = MemorySession::pair("a", "b");
        a.publish(&ReplicationMsg::Heartbeat).await.unwrap();
        b.receive(Duration::from_millis(100)).await.unwrap();
        assert!(b.last_receive_elapsed() < Duration::from_millis(100));
    }
}
