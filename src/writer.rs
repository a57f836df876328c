//! Dedicated writer task for a connection.
//!
//! Every session on a connection sends through one writer task that owns the
//! write half. Frames arrive over an mpsc channel, so frames of one stream
//! leave in the order they were queued and no session ever holds a lock on
//! the socket.
//!
//! ```text
//! Session 1 ─┐
//! Session 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! Session N ─┘
//! ```
//!
//! Ready frames are batched into a single vectored write.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{GreetError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for END_STREAM and ABORT).
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: header.encode(),
            payload,
        }
    }

    #[inline]
    pub fn empty(header: &Header) -> Self {
        Self::new(header, Bytes::new())
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "crate::config::millis")]
    pub backpressure_timeout: Duration,
}

impl WriterConfig {
    /// Reject settings the writer task cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(GreetError::Config(
                "writer.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_pending_frames == 0 {
            return Err(GreetError::Config(
                "writer.max_pending_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; every session on the connection holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active. Fails with a transport error if
    /// the writer task has stopped (socket closed or write failed).
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.backpressure.reserve().await?;

        self.tx.send(frame).await.map_err(|_| {
            self.backpressure.release();
            GreetError::Transport("connection closed".to_string())
        })
    }

    /// Queue a frame without waiting.
    ///
    /// Used from `Drop` impls, where awaiting is not possible.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.backpressure.try_reserve()?;

        self.tx.try_send(frame).map_err(|e| {
            self.backpressure.release();
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    GreetError::Transport("write queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    GreetError::Transport("connection closed".to_string())
                }
            }
        })
    }

    /// Whether the writer task is gone.
    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// A handle that does not keep the writer task running.
    pub fn downgrade(&self) -> WeakWriterHandle {
        WeakWriterHandle {
            tx: self.tx.downgrade(),
            backpressure: self.backpressure.clone(),
        }
    }
}

/// Non-owning [`WriterHandle`], for tasks that outlive no session.
///
/// Once every strong handle is gone the writer task shuts down and
/// [`upgrade`](Self::upgrade) returns `None`.
#[derive(Clone)]
pub struct WeakWriterHandle {
    tx: mpsc::WeakSender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WeakWriterHandle {
    pub fn upgrade(&self) -> Option<WriterHandle> {
        self.tx.upgrade().map(|tx| WriterHandle {
            tx,
            backpressure: self.backpressure.clone(),
        })
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly (shutting down the write half) once every handle
/// is dropped, or with an error on the first failed write. Zero capacities
/// are raised to 1.
pub fn spawn_writer_task<W>(writer: W, config: &WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = config.validate() {
        tracing::warn!("{}, using 1", e);
    }
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure = BackpressureController::with_timeout(
        config.max_pending_frames.max(1),
        config.backpressure_timeout,
    );

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let result = write_batch(&mut writer, &batch).await;
        backpressure.release_many(batch.len());
        batch.clear();

        if let Err(e) = result {
            tracing::debug!("Writer stopped: {}", e);
            return Err(e);
        }
    }

    // All handles dropped
    writer.shutdown().await?;
    Ok(())
}

/// Write a batch of frames with vectored I/O, continuing after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total_size {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(GreetError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices for everything in `batch` past the first `skip` bytes.
fn remaining_slices(batch: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            if part.is_empty() {
                continue;
            }
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            slices.push(IoSlice::new(&part[skip..]));
            skip = 0;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(stream_id: u32, payload: &'static [u8]) -> OutboundFrame {
        let header = Header::new(2, flags::RESPONSE, stream_id, payload.len() as u32);
        OutboundFrame::new(&header, Bytes::from_static(payload))
    }

    #[test]
    fn test_outbound_frame_sizes() {
        assert_eq!(frame(1, b"hello").size(), HEADER_SIZE + 5);

        let end = OutboundFrame::empty(&Header::new(2, flags::RESPONSE_END, 1, 0));
        assert!(end.payload.is_empty());
        assert_eq!(end.size(), HEADER_SIZE);
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        handle.send(frame(42, b"hello")).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();

        let header = Header::decode(&buf).unwrap();
        assert_eq!(header.stream_id, 42);
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_frames_keep_queue_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &WriterConfig::default());

        for i in 0..10u32 {
            handle.send(frame(i, b"abcd")).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * (HEADER_SIZE + 4)];
        server.read_exact(&mut buf).await.unwrap();

        for (i, chunk) in buf.chunks(HEADER_SIZE + 4).enumerate() {
            assert_eq!(Header::decode(chunk).unwrap().stream_id, i as u32);
        }
    }

    #[tokio::test]
    async fn test_send_fails_after_writer_stops() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        // First write hits the closed pipe and stops the task
        let _ = handle.send(frame(1, b"x")).await;
        assert!(task.await.unwrap().is_err());

        let result = handle.send(frame(1, b"y")).await;
        assert!(matches!(result, Err(GreetError::Transport(_))));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_remaining_slices_no_skip() {
        let batch = vec![frame(1, b"hello")];
        assert_eq!(remaining_slices(&batch, 0).len(), 2);
    }

    #[test]
    fn test_remaining_slices_partial_header() {
        let batch = vec![frame(1, b"hello")];
        let slices = remaining_slices(&batch, 5);

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 5);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_remaining_slices_skips_whole_frames() {
        let batch = vec![frame(1, b"hello"), frame(2, b"abc")];
        let slices = remaining_slices(&batch, HEADER_SIZE + 5 + 1);

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 1);
        assert_eq!(&slices[1][..], b"abc");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|i| frame(i, b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
        // Write half was shut down: reader sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_writer_config_validate() {
        assert!(WriterConfig::default().validate().is_ok());

        let zero_capacity = WriterConfig {
            channel_capacity: 0,
            ..WriterConfig::default()
        };
        assert!(matches!(zero_capacity.validate(), Err(GreetError::Config(_))));

        let zero_pending = WriterConfig {
            max_pending_frames: 0,
            ..WriterConfig::default()
        };
        assert!(matches!(zero_pending.validate(), Err(GreetError::Config(_))));
    }

    #[tokio::test]
    async fn test_zero_capacities_are_raised_to_one() {
        let (client, mut server) = duplex(4096);
        let config = WriterConfig {
            max_pending_frames: 0,
            channel_capacity: 0,
            backpressure_timeout: Duration::from_millis(50),
        };
        let (handle, _task) = spawn_writer_task(client, &config);

        handle.send(frame(3, b"abcd")).await.unwrap();

        let mut buf = vec![0u8; HEADER_SIZE + 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(Header::decode(&buf).unwrap().stream_id, 3);
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_writer_alive() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &WriterConfig::default());
        let weak = handle.downgrade();

        weak.upgrade().unwrap().send(frame(5, b"hi")).await.unwrap();
        let mut buf = vec![0u8; HEADER_SIZE + 2];
        server.read_exact(&mut buf).await.unwrap();

        drop(handle);
        assert!(task.await.unwrap().is_ok());
        assert!(weak.upgrade().is_none());
    }
}
