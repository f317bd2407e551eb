//! Frame reassembly and the per-connection I/O driver.
//!
//! [`FrameReader`] turns arbitrarily split byte chunks into whole
//! [`Message`]s. Ordinary messages are rebuilt from a small carried-over tail;
//! segment payloads are streamed straight into a pooled buffer, which is the
//! only accumulation state while a segment is in flight.
//!
//! [`run_link`] drives one stream: a read loop feeding the reassembler and a
//! write loop draining whatever the owning connection has queued, with at
//! most one drain in progress per connection.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::error::Result;
use crate::hyper::buffer_pool::{BufferPool, PooledBuf};
use crate::hyper::protocol::{
    FrameHeader, Message, MessageKind, SegmentData, FRAME_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};

/// Write buffer in front of the socket; segment payloads larger than this
/// bypass it.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

// =============================================================================
// FrameReader
// =============================================================================

enum Step {
    /// Not enough bytes yet; the next step needs this many in total
    Need(usize),
    Segment { token: u32, payload_len: usize },
    Frame(FrameHeader),
}

fn next_step(buf: &[u8], max_segment: usize) -> Result<Step> {
    let header = match FrameHeader::parse(buf, max_segment)? {
        Some(header) => header,
        None => return Ok(Step::Need(FRAME_HEADER_SIZE)),
    };

    if header.kind == MessageKind::SegmentData {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Ok(Step::Need(SEGMENT_HEADER_SIZE));
        }
        let token = u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]);
        return Ok(Step::Segment {
            token,
            payload_len: header.segment_payload_len(),
        });
    }

    if buf.len() < header.frame_len() {
        Ok(Step::Need(header.frame_len()))
    } else {
        Ok(Step::Frame(header))
    }
}

struct SegmentFill {
    token: u32,
    expected: usize,
    buf: PooledBuf,
}

impl SegmentFill {
    fn remaining(&self) -> usize {
        self.expected - self.buf.len()
    }
}

pub struct FrameReader {
    pool: Arc<BufferPool>,
    tail: BytesMut,
    segment: Option<SegmentFill>,
}

impl FrameReader {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            tail: BytesMut::with_capacity(FRAME_HEADER_SIZE + 64),
            segment: None,
        }
    }

    /// Bytes held back waiting for the rest of their message.
    pub fn buffered(&self) -> usize {
        self.tail.len() + self.segment.as_ref().map_or(0, |s| s.buf.len())
    }

    /// Whether a segment payload is currently being filled.
    pub fn in_segment(&self) -> bool {
        self.segment.is_some()
    }

    /// Drop any partial state, returning an in-flight segment buffer to the pool.
    pub fn reset(&mut self) {
        self.tail.clear();
        self.segment = None;
    }

    /// Consume one chunk, appending every message it completes to `out`.
    ///
    /// An error means the stream can no longer be trusted; the caller must
    /// close the connection.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<Message>) -> Result<()> {
        let max_segment = self.pool.buf_size();

        loop {
            if let Some(fill) = self.segment.as_mut() {
                let take = fill.remaining().min(input.len());
                fill.buf.extend_from_slice(&input[..take]);
                input = &input[take..];
                if fill.remaining() > 0 {
                    return Ok(());
                }
                if let Some(fill) = self.segment.take() {
                    trace!(token = fill.token, len = fill.expected, "segment complete");
                    out.push(Message::SegmentData(SegmentData {
                        token: fill.token,
                        data: fill.buf,
                    }));
                }
                continue;
            }

            if self.tail.is_empty() {
                if input.is_empty() {
                    return Ok(());
                }
                match next_step(input, max_segment)? {
                    Step::Need(_) => {
                        self.tail.extend_from_slice(input);
                        return Ok(());
                    }
                    Step::Segment { token, payload_len } => {
                        self.begin_segment(token, payload_len)?;
                        input = &input[SEGMENT_HEADER_SIZE..];
                    }
                    Step::Frame(header) => {
                        let end = header.frame_len();
                        out.push(Message::decode_ordinary(
                            header.kind,
                            &input[FRAME_HEADER_SIZE..end],
                        )?);
                        input = &input[end..];
                    }
                }
            } else {
                match next_step(&self.tail, max_segment)? {
                    Step::Need(total) => {
                        let take = (total - self.tail.len()).min(input.len());
                        if take == 0 {
                            return Ok(());
                        }
                        self.tail.extend_from_slice(&input[..take]);
                        input = &input[take..];
                    }
                    Step::Segment { token, payload_len } => {
                        self.tail.clear();
                        self.begin_segment(token, payload_len)?;
                    }
                    Step::Frame(header) => {
                        let msg = Message::decode_ordinary(
                            header.kind,
                            &self.tail[FRAME_HEADER_SIZE..header.frame_len()],
                        );
                        self.tail.clear();
                        out.push(msg?);
                    }
                }
            }
        }
    }

    fn begin_segment(&mut self, token: u32, payload_len: usize) -> Result<()> {
        let buf = self.pool.acquire(payload_len)?;
        self.segment = Some(SegmentFill {
            token,
            expected: payload_len,
            buf,
        });
        Ok(())
    }
}

// =============================================================================
// Link state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Something queued for the wire.
pub enum Outbound {
    /// A fully encoded frame
    Frame(Bytes),
    /// Segment payload, written after its header straight from the pool buffer
    Segment { token: u32, data: PooledBuf },
}

/// Status, flush flag and task handle shared by every connection type.
pub struct Link {
    status: Mutex<(ConnectionStatus, Instant)>,
    flushing: AtomicBool,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status: Mutex::new((status, Instant::now())),
            flushing: AtomicBool::new(false),
            wake: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().0
    }

    /// Time of the last status change.
    pub fn since(&self) -> Instant {
        self.status.lock().1
    }

    /// Returns whether the status actually changed.
    pub fn set_status(&self, status: ConnectionStatus) -> bool {
        let mut guard = self.status.lock();
        if guard.0 == status {
            return false;
        }
        *guard = (status, Instant::now());
        true
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Ask the write loop to drain the queue. A request made while a drain
    /// is running is absorbed by it.
    pub fn request_flush(&self) {
        if !self.flushing.swap(true, Ordering::AcqRel) {
            self.wake.notify_one();
        }
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop the I/O task. Partial reassembly state is dropped with it.
    pub fn abort(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.flushing.store(false, Ordering::Release);
    }
}

// =============================================================================
// Driver
// =============================================================================

/// The side of a connection that knows what messages mean and what to send.
pub trait LinkHandler: Send + Sync {
    /// Handle one decoded message. An error closes the connection.
    fn on_message(&self, msg: Message) -> Result<()>;

    /// Next item to write, if any.
    fn next_outbound(&self) -> Option<Outbound>;

    fn has_outbound(&self) -> bool;
}

/// Run a connection until the peer closes it or an error occurs.
///
/// `preamble` is written before anything else (the handshake on client legs).
pub async fn run_link<S, H>(
    stream: S,
    link: &Link,
    handler: &H,
    pool: Arc<BufferPool>,
    read_chunk: usize,
    preamble: Option<Bytes>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
    H: LinkHandler + ?Sized,
{
    let (rd, wr) = tokio::io::split(stream);
    let mut wr = BufWriter::with_capacity(WRITE_BUFFER_SIZE, wr);

    if let Some(preamble) = preamble {
        wr.write_all(&preamble).await?;
        wr.flush().await?;
    }

    let res = tokio::select! {
        res = read_loop(rd, handler, pool, read_chunk) => res,
        res = write_loop(&mut wr, link, handler) => res,
    };
    // A drain cut short must not leave the flag set for the next run.
    link.flushing.store(false, Ordering::Release);
    res
}

async fn read_loop<R, H>(mut rd: R, handler: &H, pool: Arc<BufferPool>, read_chunk: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
    H: LinkHandler + ?Sized,
{
    let mut frames = FrameReader::new(pool);
    let mut buf = vec![0u8; read_chunk.max(SEGMENT_HEADER_SIZE)];
    let mut messages = Vec::new();

    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        frames.feed(&buf[..n], &mut messages)?;
        for msg in messages.drain(..) {
            handler.on_message(msg)?;
        }
    }
}

async fn write_loop<W, H>(wr: &mut W, link: &Link, handler: &H) -> Result<()>
where
    W: AsyncWrite + Unpin,
    H: LinkHandler + ?Sized,
{
    loop {
        link.wake.notified().await;
        loop {
            while let Some(out) = handler.next_outbound() {
                write_outbound(wr, out).await?;
            }
            wr.flush().await?;
            link.flushing.store(false, Ordering::Release);

            // Work queued after the last pop but before the flag cleared
            // found the flag set and did not notify; pick it up here.
            if !handler.has_outbound() || link.flushing.swap(true, Ordering::AcqRel) {
                break;
            }
        }
    }
}

async fn write_outbound<W: AsyncWrite + Unpin>(wr: &mut W, out: Outbound) -> Result<()> {
    match out {
        Outbound::Frame(bytes) => wr.write_all(&bytes).await?,
        Outbound::Segment { token, data } => {
            wr.write_all(&SegmentData::header(token, data.len())).await?;
            wr.write_all(&data).await?;
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
