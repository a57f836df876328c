//! Connection plumbing shared by server and client.
//!
//! A connection carries many streams. The read loop parses frames and hands
//! each one to the [`StreamTable`], which routes it to the owning session's
//! inbox. Inboxes are unbounded so one slow session never stalls the read
//! loop for the others.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::codec::MsgPackCodec;
use crate::error::{GreetError, Result};
use crate::protocol::{Frame, FrameBuffer};
use crate::session::SessionShared;

/// Read buffer size.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// What the read loop hands to a session.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Encoded message payload.
    Message(Bytes),
    /// Peer half-closed.
    End,
    /// Peer terminated the stream with an error status.
    Error(String),
}

/// Outcome of routing one frame.
#[derive(Debug)]
pub(crate) enum Delivery {
    Delivered,
    /// Frame was for a stream that is no longer listening.
    Dropped,
    /// No stream with this ID is registered.
    Unknown(Frame),
}

struct StreamEntry {
    inbox: mpsc::UnboundedSender<Inbound>,
    shared: Arc<SessionShared>,
}

/// Live streams of one connection, by stream ID.
#[derive(Default)]
pub(crate) struct StreamTable {
    streams: DashMap<u32, StreamEntry>,
    /// Set once the connection is gone.
    closed: OnceLock<String>,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        stream_id: u32,
        shared: Arc<SessionShared>,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) {
        if let Some(reason) = self.closed.get() {
            shared.reset(reason.as_str());
            return;
        }
        self.streams.insert(stream_id, StreamEntry { inbox, shared });

        // Lost a race with close()
        if let Some(reason) = self.closed.get() {
            self.reset(stream_id, reason);
        }
    }

    pub(crate) fn remove(&self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Route a frame to its stream.
    ///
    /// ABORT resets the stream: its pending send fails, and its receiver
    /// sees the reset after draining what was already delivered.
    pub(crate) fn deliver(&self, frame: Frame) -> Delivery {
        let stream_id = frame.stream_id();

        if frame.is_abort() {
            if self.streams.contains_key(&stream_id) {
                self.reset(stream_id, "stream aborted by caller");
                return Delivery::Delivered;
            }
            return Delivery::Dropped;
        }

        let inbound = if frame.is_error() {
            let message = MsgPackCodec::decode::<String>(frame.payload())
                .unwrap_or_else(|_| String::from_utf8_lossy(frame.payload()).into_owned());
            Inbound::Error(message)
        } else if frame.is_end_stream() {
            Inbound::End
        } else {
            Inbound::Message(frame.payload.clone())
        };

        let sent = match self.streams.get(&stream_id) {
            Some(entry) => entry.inbox.send(inbound).is_ok(),
            None => return Delivery::Unknown(frame),
        };

        if sent {
            Delivery::Delivered
        } else {
            self.remove(stream_id);
            Delivery::Dropped
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// Fail one stream from outside and stop routing to it.
    ///
    /// Returns `false` if no such stream was registered.
    pub(crate) fn reset(&self, stream_id: u32, reason: &str) -> bool {
        match self.streams.remove(&stream_id) {
            Some((_, entry)) => {
                entry.shared.reset(reason);
                true
            }
            None => false,
        }
    }

    /// Fail every stream, now and on later registration (connection lost).
    pub(crate) fn close(&self, reason: &str) {
        let _ = self.closed.set(reason.to_string());
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for stream_id in ids {
            self.reset(stream_id, reason);
        }
    }
}

/// Read frames until EOF, passing each to `on_frame`.
///
/// Frames larger than `max_payload_size` arrive as [`Frame::discarded`]
/// headers; `on_frame` decides what to do with their stream. Returns
/// `Ok(())` when the peer closes the connection cleanly.
pub(crate) async fn read_frames<R, F>(
    mut reader: R,
    max_payload_size: u32,
    mut on_frame: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Frame),
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                if frame_buffer.is_mid_frame() {
                    return Err(GreetError::Transport(format!(
                        "connection closed mid-frame ({} bytes buffered)",
                        frame_buffer.len()
                    )));
                }
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => return Err(GreetError::Io(e)),
        };

        for frame in frame_buffer.push(&buf[..n])? {
            on_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, flags, Header, ABORT_METHOD_ID};
    use crate::session::SessionState;
    use tokio::io::{duplex, AsyncWriteExt};

    fn frame(header_flags: u8, stream_id: u32, payload: &[u8]) -> Frame {
        let header = Header::new(2, header_flags, stream_id, payload.len() as u32);
        Frame::new(header, Bytes::copy_from_slice(payload))
    }

    fn register(table: &StreamTable, stream_id: u32) -> (Arc<SessionShared>, mpsc::UnboundedReceiver<Inbound>) {
        let shared = Arc::new(SessionShared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        table.register(stream_id, shared.clone(), tx);
        (shared, rx)
    }

    #[test]
    fn test_deliver_routes_by_stream_id() {
        let table = StreamTable::new();
        let (_a, mut rx_a) = register(&table, 1);
        let (_b, mut rx_b) = register(&table, 3);

        assert!(matches!(table.deliver(frame(flags::RESPONSE, 3, b"b")), Delivery::Delivered));
        assert!(matches!(table.deliver(frame(flags::RESPONSE, 1, b"a")), Delivery::Delivered));

        assert!(matches!(rx_a.try_recv().unwrap(), Inbound::Message(p) if &p[..] == b"a"));
        assert!(matches!(rx_b.try_recv().unwrap(), Inbound::Message(p) if &p[..] == b"b"));
    }

    #[test]
    fn test_deliver_end_and_error() {
        let table = StreamTable::new();
        let (_shared, mut rx) = register(&table, 1);

        table.deliver(frame(flags::RESPONSE_END, 1, b""));
        let payload = MsgPackCodec::encode(&"boom").unwrap();
        table.deliver(frame(flags::ERROR_RESPONSE, 1, &payload));

        assert!(matches!(rx.try_recv().unwrap(), Inbound::End));
        assert!(matches!(rx.try_recv().unwrap(), Inbound::Error(m) if m == "boom"));
    }

    #[test]
    fn test_unknown_stream_returns_frame() {
        let table = StreamTable::new();
        match table.deliver(frame(flags::REQUEST, 9, b"x")) {
            Delivery::Unknown(frame) => assert_eq!(frame.stream_id(), 9),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_abort_resets_stream() {
        let table = StreamTable::new();
        let (shared, mut rx) = register(&table, 5);

        let abort = Frame::new(Header::new(ABORT_METHOD_ID, 0, 5, 0), Bytes::new());
        assert!(matches!(table.deliver(abort), Delivery::Delivered));

        assert_eq!(shared.state(), SessionState::Closed);
        assert!(table.is_empty());
        // Inbox sender is gone
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_abort_for_unknown_stream_is_dropped() {
        let table = StreamTable::new();
        let abort = Frame::new(Header::new(ABORT_METHOD_ID, 0, 5, 0), Bytes::new());
        assert!(matches!(table.deliver(abort), Delivery::Dropped));
    }

    #[test]
    fn test_deliver_to_closed_inbox_removes_stream() {
        let table = StreamTable::new();
        let (_shared, rx) = register(&table, 1);
        drop(rx);

        assert!(matches!(table.deliver(frame(flags::RESPONSE, 1, b"x")), Delivery::Dropped));
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_resets_every_stream() {
        let table = StreamTable::new();
        let (a, _rx_a) = register(&table, 1);
        let (b, _rx_b) = register(&table, 3);

        table.close("connection closed");

        assert!(table.is_closed());
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_register_after_close_fails_stream() {
        let table = StreamTable::new();
        table.close("connection closed");

        let (shared, mut rx) = register(&table, 5);

        assert_eq!(shared.state(), SessionState::Closed);
        assert!(table.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_read_frames_until_eof() {
        let (mut tx, rx) = duplex(1024);
        let mut bytes = build_frame(&Header::new(1, flags::REQUEST, 1, 2), b"hi");
        bytes.extend(build_frame(&Header::new(1, flags::REQUEST_END, 1, 0), b""));
        tx.write_all(&bytes).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        read_frames(rx, 1024, |frame| seen.push(frame)).await.unwrap();

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].payload(), b"hi");
        assert!(seen[1].is_end_stream());
    }

    #[tokio::test]
    async fn test_read_frames_truncated_frame_is_error() {
        let (mut tx, rx) = duplex(1024);
        let bytes = build_frame(&Header::new(1, flags::REQUEST, 1, 4), b"abcd");
        tx.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(tx);

        let result = read_frames(rx, 1024, |_| {}).await;
        assert!(matches!(result, Err(GreetError::Transport(_))));
    }

    #[tokio::test]
    async fn test_read_frames_skips_oversized_payload() {
        let (mut tx, rx) = duplex(64 * 1024);
        let mut bytes = build_frame(&Header::new(1, flags::REQUEST, 1, 4096), &[0u8; 4096]);
        bytes.extend(build_frame(&Header::new(1, flags::REQUEST, 3, 2), b"ok"));
        tx.write_all(&bytes).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        read_frames(rx, 1024, |frame| seen.push(frame)).await.unwrap();

        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_discarded());
        assert_eq!(seen[0].stream_id(), 1);
        assert_eq!(seen[1].payload(), b"ok");
    }

    #[tokio::test]
    async fn test_read_frames_malformed_header_is_error() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(&Header::new(0, 0, 1, 4).encode()).await.unwrap();

        let result = read_frames(rx, 1024, |_| {}).await;
        assert!(matches!(result, Err(GreetError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_frames_eof_inside_oversized_payload_is_error() {
        let (mut tx, rx) = duplex(1024);
        tx.write_all(&Header::new(1, 0, 1, 4096).encode()).await.unwrap();
        drop(tx);

        let result = read_frames(rx, 1024, |_| {}).await;
        assert!(matches!(result, Err(GreetError::Transport(_))));
    }
}
