//! Stream sessions: one RPC invocation's stream on a connection.
//!
//! A [`StreamSession`] gives ordered, typed send and receive over one stream
//! plus half-close. Both ends of every call use the same type: the caller
//! holds a `StreamSession<Request, Response>`, the handler a
//! `StreamSession<Response, Request>`.
//!
//! # Lifecycle
//!
//! ```text
//!            close_send()                 peer END
//!   Open ───────────────► LocalClosed ───────────────┐
//!     │                                              ▼
//!     └──────────────────► RemoteClosed ───────────► Closed
//!            peer END                  close_send()
//!
//!   any state ── transport error / deadline / abort / error status ──► Closed
//! ```
//!
//! Every operation on a direction that is already closed fails with
//! [`GreetError::SessionClosed`]. A failure is reported once, as the error
//! that caused it; afterwards the session is `Closed`.
//!
//! A session can be [`split`](StreamSession::split) into a
//! [`SessionSender`] and a [`SessionReceiver`] that are used independently,
//! e.g. from two tasks during bidirectional streaming.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::connection::{Inbound, StreamTable};
use crate::error::{GreetError, Result};
use crate::protocol::{flags, Header, ABORT_METHOD_ID, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{OutboundFrame, WriterHandle};

const LOCAL_CLOSED: u8 = 0b0001;
const REMOTE_CLOSED: u8 = 0b0010;
/// Terminal failure, already reported to the session owner.
const FAILED: u8 = 0b0100;
/// Failed from outside (peer abort, connection loss), not yet reported.
const RESET: u8 = 0b1000;

/// Observable state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both directions open.
    Open,
    /// We signalled completion; the peer may still send.
    LocalClosed,
    /// The peer signalled completion; we may still send.
    RemoteClosed,
    /// Terminal.
    Closed,
}

/// Which end of the call a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that opened the stream.
    Caller,
    /// The server side running the service handler.
    Handler,
}

impl Role {
    fn message_flags(self) -> u8 {
        match self {
            Role::Caller => flags::REQUEST,
            Role::Handler => flags::RESPONSE,
        }
    }

    fn end_flags(self) -> u8 {
        match self {
            Role::Caller => flags::REQUEST_END,
            Role::Handler => flags::RESPONSE_END,
        }
    }
}

/// State bits shared by a session's halves and the connection read loop.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    bits: AtomicU8,
    reset_reason: OnceLock<String>,
}

impl SessionShared {
    pub(crate) fn state(&self) -> SessionState {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & (FAILED | RESET) != 0 {
            return SessionState::Closed;
        }
        match (bits & LOCAL_CLOSED != 0, bits & REMOTE_CLOSED != 0) {
            (false, false) => SessionState::Open,
            (true, false) => SessionState::LocalClosed,
            (false, true) => SessionState::RemoteClosed,
            (true, true) => SessionState::Closed,
        }
    }

    /// Mark the stream as failed from outside the session.
    pub(crate) fn reset(&self, reason: impl Into<String>) {
        let _ = self.reset_reason.set(reason.into());
        self.bits.fetch_or(RESET, Ordering::AcqRel);
    }

    fn fail(&self) {
        self.bits.fetch_or(FAILED, Ordering::AcqRel);
    }

    /// Turn a pending reset into the error reported to the owner.
    fn take_reset(&self) -> GreetError {
        let previous = self.bits.fetch_or(FAILED, Ordering::AcqRel);
        if previous & FAILED != 0 {
            return GreetError::SessionClosed;
        }
        let reason = self
            .reset_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "stream reset".to_string());
        GreetError::Transport(reason)
    }

    fn check_send(&self) -> Result<()> {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & (FAILED | LOCAL_CLOSED) != 0 {
            return Err(GreetError::SessionClosed);
        }
        if bits & RESET != 0 {
            return Err(self.take_reset());
        }
        Ok(())
    }

    fn check_recv(&self) -> Result<()> {
        let bits = self.bits.load(Ordering::Acquire);
        if bits & (FAILED | REMOTE_CLOSED) != 0 {
            return Err(GreetError::SessionClosed);
        }
        Ok(())
    }

    fn close_local(&self) {
        self.bits.fetch_or(LOCAL_CLOSED, Ordering::AcqRel);
    }

    fn close_remote(&self) {
        self.bits.fetch_or(REMOTE_CLOSED, Ordering::AcqRel);
    }
}

/// Untyped sending side of a stream.
///
/// The server keeps a clone to finish the stream after the handler returns.
#[derive(Clone)]
pub(crate) struct StreamHandle {
    method_id: u16,
    stream_id: u32,
    role: Role,
    shared: Arc<SessionShared>,
    writer: WriterHandle,
    /// Largest payload the peer accepts.
    max_payload_size: u32,
}

impl StreamHandle {
    pub(crate) fn new(
        method_id: u16,
        stream_id: u32,
        role: Role,
        shared: Arc<SessionShared>,
        writer: WriterHandle,
    ) -> Self {
        Self {
            method_id,
            stream_id,
            role,
            shared,
            writer,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub(crate) fn with_max_payload(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub(crate) fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.state(), SessionState::Open | SessionState::RemoteClosed)
    }

    fn header(&self, frame_flags: u8, payload_len: u32) -> Header {
        Header::new(self.method_id, frame_flags, self.stream_id, payload_len)
    }

    /// Length of `payload` as it goes on the wire, if within the limit.
    fn payload_len(&self, payload: &Bytes) -> Result<u32> {
        match u32::try_from(payload.len()) {
            Ok(len) if len <= self.max_payload_size => Ok(len),
            _ => Err(GreetError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                self.max_payload_size
            ))),
        }
    }

    /// Queue one message.
    ///
    /// An oversized message fails this stream only: it is never written, and
    /// the peer is told to stop.
    pub(crate) async fn send_payload(&self, payload: Bytes, deadline: Option<Instant>) -> Result<()> {
        self.shared.check_send()?;
        let payload_len = match self.payload_len(&payload) {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!("Stream {}: {}", self.stream_id, e);
                self.abort(&e.to_string());
                return Err(e);
            }
        };
        let header = self.header(self.role.message_flags(), payload_len);
        self.queue(OutboundFrame::new(&header, payload), deadline)
            .await
    }

    pub(crate) async fn close_send(&self, deadline: Option<Instant>) -> Result<()> {
        self.shared.check_send()?;
        self.shared.close_local();
        let header = self.header(self.role.end_flags(), 0);
        self.queue(OutboundFrame::empty(&header), deadline).await
    }

    /// Terminate the stream with an error status (handler side).
    pub(crate) async fn send_error(&self, message: &str) -> Result<()> {
        self.shared.check_send()?;
        self.shared.fail();
        let frame = self.error_frame(message)?;
        self.writer.send(frame).await
    }

    /// Error status frame, with the message replaced if it would not fit.
    fn error_frame(&self, message: &str) -> Result<OutboundFrame> {
        let mut payload = MsgPackCodec::encode_bytes(&message)?;
        if self.payload_len(&payload).is_err() {
            payload = MsgPackCodec::encode_bytes(&"error message too large")?;
        }
        let payload_len = self.payload_len(&payload)?;
        let header = self.header(flags::ERROR_RESPONSE, payload_len);
        Ok(OutboundFrame::new(&header, payload))
    }

    /// Fail the stream locally and tell the peer to stop.
    ///
    /// A caller sends ABORT; a handler sends an error status carrying
    /// `reason`. Queued without waiting, so it works from `Drop`.
    fn abort(&self, reason: &str) {
        if self.shared.state() == SessionState::Closed {
            return;
        }
        self.shared.fail();

        let frame = match self.role {
            Role::Caller => {
                let header = Header::new(ABORT_METHOD_ID, flags::REQUEST, self.stream_id, 0);
                OutboundFrame::empty(&header)
            }
            Role::Handler => match self.error_frame(reason) {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };

        if let Err(e) = self.writer.try_send(frame) {
            tracing::debug!("Could not abort stream {}: {}", self.stream_id, e);
        }
    }

    fn expire(&self) -> GreetError {
        tracing::debug!("Deadline exceeded on stream {}", self.stream_id);
        self.abort("deadline exceeded");
        GreetError::DeadlineExceeded
    }

    async fn queue(&self, frame: OutboundFrame, deadline: Option<Instant>) -> Result<()> {
        let result = match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(self.expire());
                }
                match tokio::time::timeout_at(deadline, self.writer.send(frame)).await {
                    Ok(result) => result,
                    Err(_) => return Err(self.expire()),
                }
            }
            None => self.writer.send(frame).await,
        };

        if result.is_err() {
            self.shared.fail();
        }
        result
    }
}

/// Deregisters the stream once both halves are gone; aborts unfinished calls.
struct StreamGuard {
    handle: StreamHandle,
    table: Arc<StreamTable>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.table.remove(self.handle.stream_id);
        if self.handle.role == Role::Caller && self.handle.state() != SessionState::Closed {
            tracing::debug!("Stream {} dropped before completion", self.handle.stream_id);
            self.handle.abort("stream dropped before completion");
        }
    }
}

/// Typed sending half of a session.
pub struct SessionSender<S> {
    handle: StreamHandle,
    deadline: Option<Instant>,
    _guard: Arc<StreamGuard>,
    _message: PhantomData<fn(&S)>,
}

impl<S: Serialize> SessionSender<S> {
    /// Send one message.
    ///
    /// Fails with `SessionClosed` after [`close_send`](Self::close_send) or
    /// once the session has failed.
    pub async fn send(&mut self, message: &S) -> Result<()> {
        let payload = MsgPackCodec::encode_bytes(message)?;
        self.handle.send_payload(payload, self.deadline).await
    }

    /// Signal that no more messages will be sent (half-close).
    ///
    /// A second call fails with `SessionClosed`.
    pub async fn close_send(&mut self) -> Result<()> {
        self.handle.close_send(self.deadline).await
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn stream_id(&self) -> u32 {
        self.handle.stream_id
    }
}

impl<S> fmt::Debug for SessionSender<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSender")
            .field("stream_id", &self.handle.stream_id)
            .field("state", &self.handle.state())
            .finish()
    }
}

/// Typed receiving half of a session.
pub struct SessionReceiver<R> {
    handle: StreamHandle,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    deadline: Option<Instant>,
    _guard: Arc<StreamGuard>,
    _message: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> SessionReceiver<R> {
    /// Receive the next message.
    ///
    /// Returns `Ok(None)` exactly once, when the peer signals completion.
    /// Messages already received are delivered before a connection failure
    /// is reported.
    pub async fn recv(&mut self) -> Result<Option<R>> {
        self.handle.shared.check_recv()?;

        let next = match self.deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return Err(self.handle.expire());
                }
                match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                    Ok(next) => next,
                    Err(_) => return Err(self.handle.expire()),
                }
            }
            None => self.inbox.recv().await,
        };

        match next {
            Some(Inbound::Message(payload)) => match MsgPackCodec::decode(&payload) {
                Ok(message) => Ok(Some(message)),
                Err(e) => {
                    self.handle.abort("undecodable message");
                    Err(e)
                }
            },
            Some(Inbound::End) => {
                self.handle.shared.close_remote();
                Ok(None)
            }
            Some(Inbound::Error(message)) => {
                self.handle.shared.fail();
                Err(GreetError::Status(message))
            }
            // The read loop dropped our inbox: stream was reset
            None => Err(self.handle.shared.take_reset()),
        }
    }

    /// Receive exactly one message followed by completion.
    pub async fn recv_single(&mut self) -> Result<R> {
        let message = match self.recv().await? {
            Some(message) => message,
            None => {
                let reason = "stream ended without a message";
                self.handle.abort(reason);
                return Err(GreetError::Protocol(reason.to_string()));
            }
        };

        match self.recv().await? {
            None => Ok(message),
            Some(_) => {
                let reason = "expected a single message, got more";
                self.handle.abort(reason);
                Err(GreetError::Protocol(reason.to_string()))
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn stream_id(&self) -> u32 {
        self.handle.stream_id
    }
}

impl<R> fmt::Debug for SessionReceiver<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionReceiver")
            .field("stream_id", &self.handle.stream_id)
            .field("state", &self.handle.state())
            .finish()
    }
}

/// One RPC invocation's stream: sends `S`, receives `R`.
#[derive(Debug)]
pub struct StreamSession<S, R> {
    sender: SessionSender<S>,
    receiver: SessionReceiver<R>,
}

impl<S: Serialize, R: DeserializeOwned> StreamSession<S, R> {
    /// Build a session for a stream already registered in `table`.
    pub(crate) fn new(
        handle: StreamHandle,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        table: Arc<StreamTable>,
        deadline: Option<Instant>,
    ) -> Self {
        let guard = Arc::new(StreamGuard {
            handle: handle.clone(),
            table,
        });

        Self {
            sender: SessionSender {
                handle: handle.clone(),
                deadline,
                _guard: guard.clone(),
                _message: PhantomData,
            },
            receiver: SessionReceiver {
                handle,
                inbox,
                deadline,
                _guard: guard,
                _message: PhantomData,
            },
        }
    }

    pub async fn send(&mut self, message: &S) -> Result<()> {
        self.sender.send(message).await
    }

    /// Signal completion of our sending direction.
    pub async fn close_send(&mut self) -> Result<()> {
        self.sender.close_send().await
    }

    pub async fn recv(&mut self) -> Result<Option<R>> {
        self.receiver.recv().await
    }

    pub fn state(&self) -> SessionState {
        self.sender.state()
    }

    pub fn stream_id(&self) -> u32 {
        self.sender.stream_id()
    }

    pub fn method_id(&self) -> u16 {
        self.sender.handle.method_id
    }

    /// Split into independently usable halves.
    ///
    /// The stream stays registered until both halves are dropped.
    pub fn split(self) -> (SessionSender<S>, SessionReceiver<R>) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Harness {
        session: StreamSession<String, String>,
        inbox: mpsc::UnboundedSender<Inbound>,
        shared: Arc<SessionShared>,
        table: Arc<StreamTable>,
        peer: DuplexStream,
    }

    fn harness(role: Role, deadline: Option<Instant>) -> Harness {
        limited_harness(role, deadline, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    fn limited_harness(role: Role, deadline: Option<Instant>, max_payload_size: u32) -> Harness {
        let (ours, peer) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task(ours, &WriterConfig::default());
        let table = Arc::new(StreamTable::new());
        let shared = Arc::new(SessionShared::default());
        let (tx, rx) = mpsc::unbounded_channel();
        table.register(7, shared.clone(), tx.clone());

        let handle =
            StreamHandle::new(1, 7, role, shared.clone(), writer).with_max_payload(max_payload_size);
        Harness {
            session: StreamSession::new(handle, rx, table.clone(), deadline),
            inbox: tx,
            shared,
            table,
            peer,
        }
    }

    async fn read_frames(peer: &mut DuplexStream, count: usize) -> Vec<crate::protocol::Frame> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 1024];
        while frames.len() < count {
            let n = peer.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed early");
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }
        frames
    }

    fn message(text: &str) -> Inbound {
        Inbound::Message(MsgPackCodec::encode_bytes(&text).unwrap())
    }

    #[tokio::test]
    async fn test_new_session_is_open() {
        let h = harness(Role::Caller, None);
        assert_eq!(h.session.state(), SessionState::Open);
        assert_eq!(h.session.stream_id(), 7);
        assert_eq!(h.session.method_id(), 1);
    }

    #[tokio::test]
    async fn test_send_then_close_writes_frames_in_order() {
        let mut h = harness(Role::Caller, None);

        h.session.send(&"Akyu".to_string()).await.unwrap();
        h.session.send(&"Bkyu".to_string()).await.unwrap();
        h.session.close_send().await.unwrap();
        assert_eq!(h.session.state(), SessionState::LocalClosed);

        let frames = read_frames(&mut h.peer, 3).await;
        let first: String = MsgPackCodec::decode(frames[0].payload()).unwrap();
        let second: String = MsgPackCodec::decode(frames[1].payload()).unwrap();
        assert_eq!(first, "Akyu");
        assert_eq!(second, "Bkyu");
        assert!(!frames[0].is_response());
        assert!(frames[2].is_end_stream());
        assert!(frames[2].payload().is_empty());
    }

    #[tokio::test]
    async fn test_handler_frames_are_responses() {
        let mut h = harness(Role::Handler, None);

        h.session.send(&"hi".to_string()).await.unwrap();
        h.session.close_send().await.unwrap();

        let frames = read_frames(&mut h.peer, 2).await;
        assert_eq!(frames[0].header.flags, flags::RESPONSE);
        assert_eq!(frames[1].header.flags, flags::RESPONSE_END);
    }

    #[tokio::test]
    async fn test_close_twice_fails() {
        let mut h = harness(Role::Caller, None);

        h.session.close_send().await.unwrap();
        let result = h.session.close_send().await;
        assert!(matches!(result, Err(GreetError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let mut h = harness(Role::Caller, None);

        h.session.close_send().await.unwrap();
        let result = h.session.send(&"late".to_string()).await;
        assert!(matches!(result, Err(GreetError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_recv_until_completion() {
        let mut h = harness(Role::Caller, None);
        h.inbox.send(message("one")).unwrap();
        h.inbox.send(message("two")).unwrap();
        h.inbox.send(Inbound::End).unwrap();

        assert_eq!(h.session.recv().await.unwrap().as_deref(), Some("one"));
        assert_eq!(h.session.recv().await.unwrap().as_deref(), Some("two"));
        assert_eq!(h.session.recv().await.unwrap(), None);
        assert_eq!(h.session.state(), SessionState::RemoteClosed);

        // Completion is reported once; reading again is an error
        assert!(matches!(h.session.recv().await, Err(GreetError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_both_directions_closed_is_terminal() {
        let mut h = harness(Role::Caller, None);
        h.inbox.send(Inbound::End).unwrap();

        h.session.close_send().await.unwrap();
        assert_eq!(h.session.recv().await.unwrap(), None);
        assert_eq!(h.session.state(), SessionState::Closed);

        assert!(matches!(
            h.session.send(&"x".to_string()).await,
            Err(GreetError::SessionClosed)
        ));
        assert!(matches!(h.session.recv().await, Err(GreetError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_half_close_keeps_receiving() {
        let mut h = harness(Role::Caller, None);

        h.session.close_send().await.unwrap();
        h.inbox.send(message("still here")).unwrap();

        assert_eq!(
            h.session.recv().await.unwrap().as_deref(),
            Some("still here")
        );
    }

    #[tokio::test]
    async fn test_remote_close_keeps_sending() {
        let mut h = harness(Role::Handler, None);
        h.inbox.send(Inbound::End).unwrap();

        assert_eq!(h.session.recv().await.unwrap(), None);
        h.session.send(&"reply".to_string()).await.unwrap();
        h.session.close_send().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_error_status_closes_both_directions() {
        let mut h = harness(Role::Caller, None);
        h.inbox.send(Inbound::Error("handler failed".into())).unwrap();

        match h.session.recv().await {
            Err(GreetError::Status(message)) => assert_eq!(message, "handler failed"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(matches!(
            h.session.send(&"x".to_string()).await,
            Err(GreetError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reset_fails_next_send_once() {
        let mut h = harness(Role::Handler, None);
        h.shared.reset("stream aborted by caller");

        match h.session.send(&"x".to_string()).await {
            Err(GreetError::Transport(reason)) => assert_eq!(reason, "stream aborted by caller"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            h.session.send(&"y".to_string()).await,
            Err(GreetError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_queued_messages_delivered_before_reset() {
        let mut h = harness(Role::Caller, None);
        h.inbox.send(message("last words")).unwrap();
        h.shared.reset("connection closed");
        drop(h.inbox);
        h.table.remove(7);

        assert_eq!(
            h.session.recv().await.unwrap().as_deref(),
            Some("last words")
        );
        assert!(matches!(h.session.recv().await, Err(GreetError::Transport(_))));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_deadline_exceeded_aborts_stream() {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut h = harness(Role::Caller, Some(deadline));

        let result = h.session.recv().await;
        assert!(matches!(result, Err(GreetError::DeadlineExceeded)));
        assert_eq!(h.session.state(), SessionState::Closed);

        // Later messages are never processed
        h.inbox.send(message("too late")).unwrap();
        assert!(matches!(h.session.recv().await, Err(GreetError::SessionClosed)));

        let frames = read_frames(&mut h.peer, 1).await;
        assert!(frames[0].is_abort());
        assert_eq!(frames[0].stream_id(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_wins_over_ready_message() {
        let deadline = Instant::now() + Duration::from_millis(10);
        let mut h = harness(Role::Caller, Some(deadline));

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.inbox.send(message("ready")).unwrap();

        assert!(matches!(h.session.recv().await, Err(GreetError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_drop_unfinished_caller_sends_abort() {
        let mut h = harness(Role::Caller, None);
        drop(h.session);

        let frames = read_frames(&mut h.peer, 1).await;
        assert!(frames[0].is_abort());
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn test_split_halves_share_state() {
        let h = harness(Role::Caller, None);
        let inbox = h.inbox.clone();
        let (mut sender, mut receiver) = h.session.split();

        sender.close_send().await.unwrap();
        assert_eq!(receiver.state(), SessionState::LocalClosed);

        inbox.send(Inbound::End).unwrap();
        assert_eq!(receiver.recv().await.unwrap(), None);
        assert_eq!(sender.state(), SessionState::Closed);

        // Registered until both halves are dropped
        drop(sender);
        assert_eq!(h.table.len(), 1);
        drop(receiver);
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_message_is_error() {
        let mut h = harness(Role::Caller, None);
        h.inbox
            .send(Inbound::Message(Bytes::from_static(b"\xc1")))
            .unwrap();

        assert!(matches!(
            h.session.recv().await,
            Err(GreetError::MsgPackDecode(_))
        ));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_recv_single() {
        let h = harness(Role::Caller, None);
        h.inbox.send(message("only")).unwrap();
        h.inbox.send(Inbound::End).unwrap();

        let (_sender, mut receiver) = h.session.split();
        assert_eq!(receiver.recv_single().await.unwrap(), "only");
    }

    #[tokio::test]
    async fn test_recv_single_rejects_extra_messages() {
        let h = harness(Role::Caller, None);
        h.inbox.send(message("one")).unwrap();
        h.inbox.send(message("two")).unwrap();

        let (_sender, mut receiver) = h.session.split();
        assert!(matches!(
            receiver.recv_single().await,
            Err(GreetError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_protocol_failure_sends_error_status() {
        let mut h = harness(Role::Handler, None);
        h.inbox.send(Inbound::End).unwrap();

        let (_sender, mut receiver) = h.session.split();
        assert!(matches!(
            receiver.recv_single().await,
            Err(GreetError::Protocol(_))
        ));
        assert_eq!(receiver.state(), SessionState::Closed);

        let frames = read_frames(&mut h.peer, 1).await;
        assert_eq!(frames[0].header.flags, flags::ERROR_RESPONSE);
        let reason: String = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(reason, "stream ended without a message");
    }

    #[tokio::test]
    async fn test_oversized_send_aborts_only_this_stream() {
        let mut h = limited_harness(Role::Caller, None, 64);

        let result = h.session.send(&"x".repeat(100)).await;
        assert!(matches!(result, Err(GreetError::Protocol(ref m)) if m.contains("exceeds maximum")));
        assert_eq!(h.session.state(), SessionState::Closed);

        // Only the ABORT reaches the wire, never the oversized message
        let frames = read_frames(&mut h.peer, 1).await;
        assert!(frames[0].is_abort());
        assert_eq!(frames[0].stream_id(), 7);
    }

    #[tokio::test]
    async fn test_message_at_the_limit_is_sent() {
        let text = "y".repeat(62);
        let encoded = MsgPackCodec::encode_bytes(&text).unwrap();
        let mut h = limited_harness(Role::Caller, None, encoded.len() as u32);

        h.session.send(&text).await.unwrap();
        let frames = read_frames(&mut h.peer, 1).await;
        assert_eq!(frames[0].payload(), &encoded[..]);
    }

    #[tokio::test]
    async fn test_oversized_handler_reply_becomes_error_status() {
        let mut h = limited_harness(Role::Handler, None, 64);

        assert!(matches!(
            h.session.send(&"z".repeat(100)).await,
            Err(GreetError::Protocol(_))
        ));
        assert_eq!(h.session.state(), SessionState::Closed);

        let frames = read_frames(&mut h.peer, 1).await;
        assert_eq!(frames[0].header.flags, flags::ERROR_RESPONSE);
        let reason: String = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert!(reason.contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_oversized_error_message_is_replaced() {
        let mut h = limited_harness(Role::Handler, None, 64);

        h.session.sender.handle.send_error(&"e".repeat(500)).await.unwrap();

        let frames = read_frames(&mut h.peer, 1).await;
        assert!(frames[0].is_error());
        let reason: String = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(reason, "error message too large");
    }
}
