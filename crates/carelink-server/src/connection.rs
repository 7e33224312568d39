//! A single live socket and the two loops that service it.
//!
//! Each connection owns a bounded outbound queue. Producers (the router,
//! replies from the inbound handler) only ever `try_send` onto it; the
//! write loop is its sole consumer and forwards frames to the socket in
//! FIFO order. The read loop decodes inbound frames and hands them to an
//! [`InboundHandler`]. Whichever side fails first tears the connection
//! down; teardown runs its effect exactly once.

use crate::protocol::{ClientFrame, ServerFrame};
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use carelink_types::UserIdentity;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Outbound queue capacity used when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Result of offering a frame to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    /// The queue is at capacity; the frame was dropped.
    Full,
    /// The connection is shutting down; the frame was dropped.
    Closed,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    ReadError,
    WriteError,
    Replaced,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Socket failure contained to one connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Socket(String),
}

/// Handles decoded frames arriving on a connection.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_frame(&self, conn: &Arc<Connection>, frame: ClientFrame);
}

/// One authenticated, upgraded socket.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    identity: UserIdentity,
    queue: mpsc::Sender<String>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    opened_at: DateTime<Utc>,
}

/// Consumer half of a connection's outbound queue, owned by the write loop.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<String>,
}

impl OutboundQueue {
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Returns the next queued frame without waiting.
    pub fn try_next(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Connection {
    /// Creates a connection with an outbound queue of `capacity` frames
    /// (at least one).
    pub fn new(identity: UserIdentity, capacity: usize) -> (Arc<Self>, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            identity,
            queue: tx,
            closed: AtomicBool::new(false),
            close_tx,
            opened_at: Utc::now(),
        });
        (conn, OutboundQueue { rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Offers a serialized frame without waiting.
    pub fn enqueue(&self, frame: String) -> Enqueue {
        if self.is_closed() {
            return Enqueue::Closed;
        }
        match self.queue.try_send(frame) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Sends a frame back to this connection only, logging instead of
    /// failing.
    pub fn reply(&self, frame: &ServerFrame) {
        match frame.encode() {
            Ok(json) => match self.enqueue(json) {
                Enqueue::Accepted => {}
                Enqueue::Full => tracing::warn!(
                    identity = %self.identity,
                    connection_id = %self.id,
                    "dropping reply for slow consumer"
                ),
                Enqueue::Closed => tracing::debug!(
                    connection_id = %self.id,
                    "reply dropped, connection closed"
                ),
            },
            Err(e) => tracing::error!("failed to serialize reply frame: {}", e),
        }
    }

    /// Marks the connection closed and wakes both loops.
    ///
    /// Returns `true` only for the first caller.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_tx.send_replace(true);
        true
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Closes the connection and removes it from the registry.
///
/// Safe to call from both loops at once; only the first call has any
/// effect, and only that call returns `true`.
pub fn teardown(registry: &ConnectionRegistry, conn: &Connection, reason: CloseReason) -> bool {
    if !conn.close() {
        return false;
    }
    registry.unregister(conn.identity(), conn.id());
    tracing::info!(
        identity = %conn.identity(),
        connection_id = %conn.id(),
        reason = reason.as_str(),
        open_for_secs = (Utc::now() - conn.opened_at()).num_seconds(),
        "connection closed"
    );
    true
}

/// Drains the outbound queue into the socket until the connection closes
/// or a write fails.
pub async fn run_write_loop<S>(
    conn: Arc<Connection>,
    mut queue: OutboundQueue,
    mut sink: S,
    registry: ConnectionRegistry,
) where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let mut closed = conn.closed_signal();

    let failure = loop {
        let frame = tokio::select! {
            biased;
            _ = closed.wait_for(|is_closed| *is_closed) => break None,
            frame = queue.next() => frame,
        };
        // The connection holds the sender, so the queue cannot run dry first.
        let Some(frame) = frame else { break None };

        tokio::select! {
            biased;
            _ = closed.wait_for(|is_closed| *is_closed) => break None,
            sent = sink.send(WsMessage::Text(frame.into())) => {
                if let Err(e) = sent {
                    break Some(ConnectionError::Socket(e.to_string()));
                }
            }
        }
    };

    if let Some(err) = failure {
        tracing::debug!(
            identity = %conn.identity(),
            connection_id = %conn.id(),
            "write loop ended: {}",
            err
        );
        teardown(&registry, &conn, CloseReason::WriteError);
    }

    // Best effort; the peer may already be gone.
    let _ = sink.close().await;
}

/// Reads frames from the socket and dispatches them until the peer closes,
/// the socket fails, or the connection is closed from elsewhere.
pub async fn run_read_loop<St, E>(
    conn: Arc<Connection>,
    mut stream: St,
    handler: Arc<dyn InboundHandler>,
    registry: ConnectionRegistry,
) where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let mut closed = conn.closed_signal();

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|is_closed| *is_closed) => break None,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => handler.on_frame(&conn, frame).await,
                    Err(e) => {
                        tracing::warn!(
                            identity = %conn.identity(),
                            "failed to parse incoming frame: {}",
                            e
                        );
                        conn.reply(&ServerFrame::error("invalid message format"));
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break Some(CloseReason::ClientClosed),
            // Pings are answered by the socket layer; binary frames are not part of the protocol.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let err = ConnectionError::Socket(e.to_string());
                tracing::debug!(
                    identity = %conn.identity(),
                    connection_id = %conn.id(),
                    "read loop ended: {}",
                    err
                );
                break Some(CloseReason::ReadError);
            }
        }
    };

    if let Some(reason) = reason {
        teardown(&registry, &conn, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// A sink that forwards every text frame to an unbounded channel.
    fn capture_sink() -> (
        impl Sink<WsMessage, Error = String> + Unpin,
        UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let sink = futures_util::sink::unfold(tx, |tx, msg: WsMessage| async move {
            if let WsMessage::Text(text) = msg {
                tx.send(text.to_string()).map_err(|e| e.to_string())?;
            }
            Ok::<_, String>(tx)
        });
        (Box::pin(sink), rx)
    }

    fn failing_sink() -> impl Sink<WsMessage, Error = String> + Unpin {
        Box::pin(futures_util::sink::unfold((), |(), _msg: WsMessage| async move {
            Err::<(), String>("broken pipe".to_string())
        }))
    }

    struct CountingHandler {
        frames: AtomicUsize,
    }

    #[async_trait]
    impl InboundHandler for CountingHandler {
        async fn on_frame(&self, conn: &Arc<Connection>, frame: ClientFrame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
            if frame == ClientFrame::Ping {
                conn.reply(&ServerFrame::Pong);
            }
        }
    }

    #[test]
    fn full_queue_rejects_new_frames() {
        let (conn, mut queue) = Connection::new(UserIdentity::from("doc-42"), 2);
        assert_eq!(conn.enqueue("m1".into()), Enqueue::Accepted);
        assert_eq!(conn.enqueue("m2".into()), Enqueue::Accepted);
        assert_eq!(conn.enqueue("m3".into()), Enqueue::Full);

        assert_eq!(queue.try_next().as_deref(), Some("m1"));
        assert_eq!(queue.try_next().as_deref(), Some("m2"));
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn closed_connection_rejects_frames() {
        let (conn, _queue) = Connection::new(UserIdentity::from("doc-42"), 2);
        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.enqueue("late".into()), Enqueue::Closed);
    }

    #[tokio::test]
    async fn write_loop_preserves_fifo_order() {
        let registry = ConnectionRegistry::default();
        let (conn, queue) = Connection::new(UserIdentity::from("doc-42"), 8);
        registry.register(conn.clone());

        for frame in ["m1", "m2", "m3"] {
            assert_eq!(conn.enqueue(frame.to_string()), Enqueue::Accepted);
        }

        let (sink, mut written) = capture_sink();
        let writer = tokio::spawn(run_write_loop(conn.clone(), queue, sink, registry.clone()));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(written.recv().await.expect("frame written"));
        }
        assert_eq!(seen, vec!["m1", "m2", "m3"]);

        assert!(teardown(&registry, &conn, CloseReason::Shutdown));
        writer.await.expect("write loop exits on close");
        assert!(!registry.is_online(conn.identity()));
    }

    #[tokio::test]
    async fn write_failure_tears_down_the_connection() {
        let registry = ConnectionRegistry::default();
        let (conn, queue) = Connection::new(UserIdentity::from("doc-42"), 8);
        registry.register(conn.clone());
        conn.enqueue("m1".to_string());

        run_write_loop(conn.clone(), queue, failing_sink(), registry.clone()).await;

        assert!(conn.is_closed());
        assert!(!registry.is_online(conn.identity()));
    }

    #[tokio::test]
    async fn read_loop_dispatches_frames_and_unregisters_on_close() {
        let registry = ConnectionRegistry::default();
        let (conn, mut queue) = Connection::new(UserIdentity::from("pat-7"), 8);
        registry.register(conn.clone());

        let frames = vec![
            Ok::<_, String>(WsMessage::Text(r#"{"type":"ping"}"#.to_string().into())),
            Ok(WsMessage::Text("not json".to_string().into())),
            Ok(WsMessage::Close(None)),
        ];
        let handler = Arc::new(CountingHandler {
            frames: AtomicUsize::new(0),
        });

        run_read_loop(
            conn.clone(),
            stream::iter(frames),
            handler.clone(),
            registry.clone(),
        )
        .await;

        assert_eq!(handler.frames.load(Ordering::SeqCst), 1);
        let pong: serde_json::Value =
            serde_json::from_str(&queue.try_next().expect("pong queued")).unwrap();
        assert_eq!(pong["type"], "pong");
        let error: serde_json::Value =
            serde_json::from_str(&queue.try_next().expect("error queued")).unwrap();
        assert_eq!(error["type"], "error");

        assert!(conn.is_closed());
        assert!(!registry.is_online(conn.identity()));
    }

    #[tokio::test]
    async fn read_loop_stops_when_closed_elsewhere() {
        let registry = ConnectionRegistry::default();
        let (conn, _queue) = Connection::new(UserIdentity::from("pat-7"), 8);
        registry.register(conn.clone());
        let handler = Arc::new(CountingHandler {
            frames: AtomicUsize::new(0),
        });

        let reader = tokio::spawn(run_read_loop(
            conn.clone(),
            stream::pending::<Result<WsMessage, String>>(),
            handler,
            registry.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(teardown(&registry, &conn, CloseReason::Replaced));
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read loop should stop")
            .expect("read loop should not panic");
    }

    #[tokio::test]
    async fn concurrent_teardown_runs_once() {
        let registry = ConnectionRegistry::default();
        let (conn, _queue) = Connection::new(UserIdentity::from("doc-42"), 8);
        registry.register(conn.clone());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                teardown(&registry, &conn, CloseReason::ReadError)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("task should not panic") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!registry.is_online(conn.identity()));
    }
}
