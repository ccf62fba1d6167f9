//! Async block framer over a duplex stream.
//!
//! A reader task reassembles blocks with [`BlockDecoder`] and queues them as
//! [`FramerEvent`]s; blocks wait in the queue until the owner asks for them,
//! so nothing read before the owner is ready gets lost. A writer task owns the
//! write half and acknowledges each block once the stream accepted it.

use crate::connection::{killed, SocketGuard};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use tubemail_wire::{encode_block, BlockDecoder, WireError};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const EVENT_QUEUE_SIZE: usize = 64;
const WRITE_QUEUE_SIZE: usize = 64;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Framer errors
#[derive(Error, Debug)]
pub enum FramerError {
    /// The stream has ended; nothing can be sent anymore
    #[error("connection is closed")]
    Closed,

    /// The stream failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent a block we refuse to reassemble
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Output of the reader side
#[derive(Debug)]
pub enum FramerEvent {
    /// One complete block
    Block(Bytes),
    /// The stream ended, with the error that ended it if any. Always the last
    /// event.
    Closed(Option<FramerError>),
}

enum WriteRequest {
    Block(Bytes, oneshot::Sender<Result<(), FramerError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable write handle
#[derive(Clone)]
pub struct FrameSender {
    writes: mpsc::Sender<WriteRequest>,
    closed: Arc<AtomicBool>,
}

impl FrameSender {
    /// Send one block made of `fragments`. Resolves once the stream accepted
    /// the bytes.
    pub async fn send<B: AsRef<[u8]>>(&self, fragments: &[B]) -> Result<(), FramerError> {
        if self.is_closed() {
            return Err(FramerError::Closed);
        }

        let block = encode_block(fragments)?;
        let (done, result) = oneshot::channel();
        self.writes
            .send(WriteRequest::Block(block, done))
            .await
            .map_err(|_| FramerError::Closed)?;
        result.await.map_err(|_| FramerError::Closed)?
    }

    /// Whether the stream has ended
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Framer owning both halves of a stream
pub struct Framer {
    sender: FrameSender,
    events: mpsc::Receiver<FramerEvent>,
    reader: JoinHandle<()>,
}

impl Framer {
    /// Split `stream` and start the reader and writer tasks.
    ///
    /// The stream is dropped, and `guard` released, once both tasks ended.
    /// Both tasks stop when `kill` turns true.
    pub fn new<S>(stream: S, kill: watch::Receiver<bool>, guard: SocketGuard) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_max_block_size(stream, kill, guard, tubemail_wire::DEFAULT_MAX_BLOCK_SIZE)
    }

    /// Like [`Framer::new`] with a custom block size limit
    pub fn with_max_block_size<S>(
        stream: S,
        kill: watch::Receiver<bool>,
        guard: SocketGuard,
        max_block_size: usize,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(stream);
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (writes, writes_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let guard = Arc::new(guard);

        let reader = tokio::spawn(read_loop(
            rd,
            BlockDecoder::with_max_block_size(max_block_size),
            events_tx,
            kill.clone(),
            closed.clone(),
            guard.clone(),
        ));
        tokio::spawn(write_loop(wr, writes_rx, kill, closed.clone(), guard));

        Self {
            sender: FrameSender { writes, closed },
            events,
            reader,
        }
    }

    /// Write handle that outlives borrows of the framer
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Send one block
    pub async fn send<B: AsRef<[u8]>>(&self, fragments: &[B]) -> Result<(), FramerError> {
        self.sender.send(fragments).await
    }

    /// Next event. Returns `None` after [`FramerEvent::Closed`] was taken.
    pub async fn next(&mut self) -> Option<FramerEvent> {
        self.events.recv().await
    }

    /// Shut down the write side, then stop reading.
    pub async fn close(&mut self) {
        self.sender.closed.store(true, Ordering::Release);
        let (done, flushed) = oneshot::channel();
        if self.sender.writes.send(WriteRequest::Shutdown(done)).await.is_ok() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, flushed).await;
        }
        self.reader.abort();
    }
}

impl Drop for Framer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    mut rd: R,
    mut decoder: BlockDecoder,
    events: mpsc::Sender<FramerEvent>,
    mut kill: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    _guard: Arc<SocketGuard>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let error = 'read: loop {
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(block)) => {
                    trace!("Read block of {} bytes", block.len());
                    if events.send(FramerEvent::Block(block)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => break 'read Some(FramerError::Wire(e)),
            }
        }

        tokio::select! {
            _ = killed(&mut kill) => break 'read None,
            read = rd.read_buf(&mut buf) => match read {
                Ok(0) => break 'read None,
                Ok(_) => {}
                Err(e) => break 'read Some(FramerError::Io(e)),
            },
        }
    };

    closed.store(true, Ordering::Release);
    if let Some(e) = &error {
        debug!("Stream ended with error: {}", e);
    }
    let _ = events.send(FramerEvent::Closed(error)).await;
}

async fn write_loop<W>(
    mut wr: W,
    mut requests: mpsc::Receiver<WriteRequest>,
    mut kill: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    _guard: Arc<SocketGuard>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = killed(&mut kill) => break,
            request = requests.recv() => request,
        };

        match request {
            Some(WriteRequest::Block(block, done)) => {
                let result = tokio::select! {
                    _ = killed(&mut kill) => {
                        let _ = done.send(Err(FramerError::Closed));
                        break;
                    }
                    written = wr.write_all(&block) => written.map_err(FramerError::Io),
                };
                let failed = result.is_err();
                let _ = done.send(result);
                if failed {
                    break;
                }
            }
            Some(WriteRequest::Shutdown(done)) => {
                tokio::select! {
                    _ = killed(&mut kill) => {}
                    _ = wr.shutdown() => {}
                }
                let _ = done.send(());
                break;
            }
            None => {
                tokio::select! {
                    _ = killed(&mut kill) => {}
                    _ = wr.shutdown() => {}
                }
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}
