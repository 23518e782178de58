//! Append-only frame log for a single job
//!
//! One writer appends frames; any number of readers attach at any time and
//! receive every frame from the start, then follow live writes until the
//! buffer is closed. Each reader owns its cursor, so a slow reader never holds
//! up the writer or other readers.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("replay buffer is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct FrameLog {
    frames: Vec<Bytes>,
    closed: bool,
}

#[derive(Debug)]
pub struct ReplayBuffer {
    log: watch::Sender<FrameLog>,
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayBuffer {
    pub fn new() -> Self {
        let (log, _) = watch::channel(FrameLog::default());
        Self { log }
    }

    /// Append a frame and wake attached readers
    pub fn write(&self, frame: Bytes) -> Result<(), BufferError> {
        let mut result = Ok(());
        self.log.send_if_modified(|log| {
            if log.closed {
                result = Err(BufferError::Closed);
                return false;
            }
            log.frames.push(frame);
            true
        });
        result
    }

    /// Mark end-of-stream. Idempotent.
    pub fn close(&self) {
        self.log.send_if_modified(|log| {
            if log.closed {
                return false;
            }
            log.closed = true;
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        self.log.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.log.borrow().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once the buffer is closed
    pub async fn closed(&self) {
        let mut rx = self.log.subscribe();
        // The sender lives in `self`, so the channel cannot be dropped while we wait.
        let _ = rx.wait_for(|log| log.closed).await;
    }

    /// Reader positioned at the first frame
    pub fn attach(&self) -> ReplayReader {
        ReplayReader {
            log: self.log.subscribe(),
            cursor: 0,
        }
    }

    /// Copy every frame into `sink`, then shut it down once the buffer is closed
    pub fn pipe_to<W>(&self, sink: W) -> JoinHandle<std::io::Result<()>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = self.attach();
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(frame) = reader.next().await {
                sink.write_all(&frame).await?;
            }
            sink.flush().await?;
            sink.shutdown().await
        })
    }
}

/// Cursor over a [`ReplayBuffer`]
pub struct ReplayReader {
    log: watch::Receiver<FrameLog>,
    cursor: usize,
}

impl ReplayReader {
    /// Next frame, waiting for the writer if caught up. `None` after close.
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            {
                let log = self.log.borrow_and_update();
                if let Some(frame) = log.frames.get(self.cursor) {
                    self.cursor += 1;
                    return Some(frame.clone());
                }
                if log.closed {
                    return None;
                }
            }
            if self.log.changed().await.is_err() {
                return None;
            }
        }
    }
}
