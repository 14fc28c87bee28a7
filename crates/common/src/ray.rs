//! Rays connect an inbound listener to an outbound handler.
//!
//! A ray is two independent pipes. `input` carries bytes from the inbound side
//! to the outbound side and `output` carries the replies back. Every pipe is a
//! bounded FIFO of immutable chunks with a single producer and a single
//! consumer. A producer ends the stream either cleanly (`close`) or abruptly
//! (`release`), and a consumer that stops listening releases the pipe so a
//! blocked producer wakes up instead of hanging.
//!
//! Dropping a pipe end that has not reached a terminal state releases it.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use log::trace;
use thiserror::Error;
use tokio::sync::Notify;

pub const DEFAULT_PIPE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Open,
    /// The producer finished; buffered chunks are still readable.
    Closed,
    /// Aborted by either end; buffered chunks are discarded.
    Released,
}

impl PipeState {
    pub fn is_terminal(self) -> bool {
        self != PipeState::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe is closed")]
    Closed,
    #[error("pipe was released")]
    Released,
}

impl From<PipeError> for io::Error {
    fn from(e: PipeError) -> Self {
        match e {
            PipeError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, e),
            PipeError::Released => io::Error::new(io::ErrorKind::ConnectionAborted, e),
        }
    }
}

struct Inner {
    queue: VecDeque<Bytes>,
    state: PipeState,
}

struct Shared {
    inner: Mutex<Inner>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PipeState {
        self.lock().state
    }

    fn wake_both(&self) {
        self.readable.notify_one();
        self.writable.notify_one();
    }

    fn close(&self) {
        let mut inner = self.lock();
        if inner.state == PipeState::Open {
            inner.state = PipeState::Closed;
            drop(inner);
            self.wake_both();
        }
    }

    fn release(&self) {
        let mut inner = self.lock();
        if inner.state != PipeState::Released {
            inner.state = PipeState::Released;
            inner.queue.clear();
            drop(inner);
            self.wake_both();
        }
    }

    fn release_if_open(&self) {
        let mut inner = self.lock();
        if inner.state == PipeState::Open {
            trace!("pipe end dropped while open, releasing");
            inner.state = PipeState::Released;
            inner.queue.clear();
            drop(inner);
            self.wake_both();
        }
    }
}

/// Creates one pipe holding at most `capacity` chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            queue: VecDeque::with_capacity(capacity),
            state: PipeState::Open,
        }),
        capacity: capacity.max(1),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Queues a chunk, waiting while the pipe is full.
    ///
    /// Fails as soon as the pipe reaches a terminal state, including while
    /// waiting for room.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), PipeError> {
        if chunk.is_empty() {
            return Ok(());
        }
        loop {
            {
                let mut inner = self.shared.lock();
                match inner.state {
                    PipeState::Closed => return Err(PipeError::Closed),
                    PipeState::Released => return Err(PipeError::Released),
                    PipeState::Open => {}
                }
                if inner.queue.len() < self.shared.capacity {
                    inner.queue.push_back(chunk);
                    drop(inner);
                    self.shared.readable.notify_one();
                    return Ok(());
                }
            }
            self.shared.writable.notified().await;
        }
    }

    /// Signals a clean end of stream. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Aborts the stream and drops whatever is still buffered.
    pub fn release(&self) {
        self.shared.release();
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.release_if_open();
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Returns the next chunk, `None` once the pipe was closed and drained,
    /// or `PipeError::Released` if it was aborted.
    pub async fn read(&mut self) -> Result<Option<Bytes>, PipeError> {
        loop {
            {
                let mut inner = self.shared.lock();
                if inner.state == PipeState::Released {
                    return Err(PipeError::Released);
                }
                if let Some(chunk) = inner.queue.pop_front() {
                    drop(inner);
                    self.shared.writable.notify_one();
                    return Ok(Some(chunk));
                }
                if inner.state == PipeState::Closed {
                    return Ok(None);
                }
            }
            self.shared.readable.notified().await;
        }
    }

    /// Stops consuming; a producer blocked on a full pipe fails immediately.
    pub fn release(&self) {
        self.shared.release();
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.release_if_open();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayState {
    Open,
    HalfClosed,
    Closed,
}

fn ray_state(input: PipeState, output: PipeState) -> RayState {
    match (input.is_terminal(), output.is_terminal()) {
        (false, false) => RayState::Open,
        (true, true) => RayState::Closed,
        _ => RayState::HalfClosed,
    }
}

/// The listener's half: writes `input`, reads `output`.
pub struct InboundRay {
    input: PipeWriter,
    output: PipeReader,
}

impl InboundRay {
    pub fn inbound_input(&mut self) -> &mut PipeWriter {
        &mut self.input
    }

    pub fn inbound_output(&mut self) -> &mut PipeReader {
        &mut self.output
    }

    pub fn into_parts(self) -> (PipeWriter, PipeReader) {
        (self.input, self.output)
    }

    pub fn state(&self) -> RayState {
        ray_state(self.input.state(), self.output.state())
    }
}

/// The outbound handler's half: reads `input`, writes `output`.
pub struct OutboundRay {
    input: PipeReader,
    output: PipeWriter,
}

impl OutboundRay {
    pub fn outbound_input(&mut self) -> &mut PipeReader {
        &mut self.input
    }

    pub fn outbound_output(&mut self) -> &mut PipeWriter {
        &mut self.output
    }

    pub fn into_parts(self) -> (PipeReader, PipeWriter) {
        (self.input, self.output)
    }

    pub fn state(&self) -> RayState {
        ray_state(self.input.state(), self.output.state())
    }
}

/// Allocates a fresh ray whose pipes hold `capacity` chunks each.
pub fn ray(capacity: usize) -> (InboundRay, OutboundRay) {
    let (input_writer, input_reader) = pipe(capacity);
    let (output_writer, output_reader) = pipe(capacity);
    (
        InboundRay {
            input: input_writer,
            output: output_reader,
        },
        OutboundRay {
            input: input_reader,
            output: output_writer,
        },
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn chunks_arrive_in_order_then_eof() {
        let (mut writer, mut reader) = pipe(4);
        for word in ["a", "bb", "ccc"] {
            writer.write(Bytes::from(word)).await.unwrap();
        }
        writer.close();
        writer.close();

        assert_eq!(reader.read().await.unwrap(), Some(Bytes::from("a")));
        assert_eq!(reader.read().await.unwrap(), Some(Bytes::from("bb")));
        assert_eq!(reader.read().await.unwrap(), Some(Bytes::from("ccc")));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(writer.write(Bytes::from("late")).await, Err(PipeError::Closed));
    }

    #[tokio::test]
    async fn release_is_distinct_from_close() {
        let (mut writer, mut reader) = pipe(4);
        writer.write(Bytes::from("dropped")).await.unwrap();
        writer.release();

        assert_eq!(reader.read().await, Err(PipeError::Released));
        assert_eq!(reader.state(), PipeState::Released);
    }

    #[tokio::test]
    async fn full_pipe_blocks_writer() {
        let (mut writer, _reader) = pipe(2);
        writer.write(Bytes::from("1")).await.unwrap();
        writer.write(Bytes::from("2")).await.unwrap();

        let blocked = timeout(Duration::from_millis(50), writer.write(Bytes::from("3"))).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn reader_release_unblocks_writer() {
        let (mut writer, reader) = pipe(1);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = writer.write(Bytes::from_static(b"x")).await {
                    return e;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        reader.release();

        let err = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(err, PipeError::Released);
    }

    #[tokio::test]
    async fn dropped_reader_unblocks_writer() {
        let (mut writer, reader) = pipe(1);
        writer.write(Bytes::from("1")).await.unwrap();
        let task = tokio::spawn(async move { writer.write(Bytes::from("2")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(reader);

        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(result, Err(PipeError::Released));
    }

    #[tokio::test]
    async fn dropped_writer_aborts_reader() {
        let (writer, mut reader) = pipe(1);
        let task = tokio::spawn(async move { reader.read().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(writer);

        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(result, Err(PipeError::Released));
    }

    #[tokio::test]
    async fn ray_state_progresses() {
        let (inbound, outbound) = ray(DEFAULT_PIPE_CAPACITY);
        assert_eq!(inbound.state(), RayState::Open);

        let (input, mut output) = inbound.into_parts();
        input.close();
        assert_eq!(outbound.state(), RayState::HalfClosed);

        let (_in_reader, out_writer) = outbound.into_parts();
        out_writer.close();
        assert_eq!(output.read().await.unwrap(), None);
        assert_eq!(ray_state(input.state(), output.state()), RayState::Closed);
    }
}
