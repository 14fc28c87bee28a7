use std::{
    future::Future,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::BytesMut;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Notify,
    time::{sleep_until, Instant},
};

use crate::ray::{PipeReader, PipeWriter};

pub const BUFFER_SIZE: usize = 8 * 1024;

/// Inactivity limits for one relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Both directions open and nothing moves.
    pub idle: Duration,
    /// The download finished and the upload is silent.
    pub uplink_only: Duration,
    /// The upload finished and the download is silent.
    pub downlink_only: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(2),
            downlink_only: Duration::from_secs(5),
        }
    }
}

struct Activity {
    last: Instant,
    timeout: Duration,
}

struct TimerShared {
    activity: Mutex<Activity>,
    changed: Notify,
}

/// Remembers when a relay last made progress.
#[derive(Clone)]
pub struct ActivityTimer {
    shared: Arc<TimerShared>,
}

impl ActivityTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                activity: Mutex::new(Activity {
                    last: Instant::now(),
                    timeout,
                }),
                changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Activity> {
        self.shared
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self) {
        self.lock().last = Instant::now();
    }

    /// Replaces the limit, counting from now.
    pub fn set_timeout(&self, timeout: Duration) {
        {
            let mut activity = self.lock();
            activity.last = Instant::now();
            activity.timeout = timeout;
        }
        self.shared.changed.notify_one();
    }

    fn deadline(&self) -> Instant {
        let activity = self.lock();
        activity.last + activity.timeout
    }

    /// Completes once no progress was recorded for the current limit.
    pub async fn expired(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = self.shared.changed.notified() => {}
            }
        }
    }
}

/// Drives both directions of a connection until they finish or `timer`
/// expires.
///
/// Once `upload` is done the download may only stay silent for
/// `downlink_only`, and the other way round for `uplink_only`. Expiry is
/// reported as `TimedOut`; the caller releases whatever pipes are still open.
pub async fn relay<U, D>(
    timer: &ActivityTimer,
    timeouts: Timeouts,
    upload: U,
    download: D,
) -> io::Result<(u64, u64)>
where
    U: Future<Output = io::Result<u64>>,
    D: Future<Output = io::Result<u64>>,
{
    let upload = async move {
        let n = upload.await?;
        timer.set_timeout(timeouts.downlink_only);
        Ok::<_, io::Error>(n)
    };
    let download = async move {
        let n = download.await?;
        timer.set_timeout(timeouts.uplink_only);
        Ok::<_, io::Error>(n)
    };
    tokio::select! {
        result = async { tokio::try_join!(upload, download) } => result,
        _ = timer.expired() => {
            debug!("relay made no progress, giving up");
            Err(io::Error::new(io::ErrorKind::TimedOut, "connection idle"))
        }
    }
}

/// Reads `reader` to EOF, forwarding every read as one chunk.
///
/// The pipe is closed on EOF and released on a read error.
pub async fn copy_to_pipe<R>(
    reader: &mut R,
    pipe: &mut PipeWriter,
    timer: &ActivityTimer,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
    let mut total = 0u64;
    loop {
        buf.reserve(BUFFER_SIZE);
        let n = match reader.read_buf(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                pipe.release();
                return Err(e);
            }
        };
        if n == 0 {
            pipe.close();
            trace!("copied {} bytes into pipe", total);
            return Ok(total);
        }
        total += n as u64;
        pipe.write(buf.split().freeze()).await?;
        timer.update();
    }
}

/// Writes every chunk of `pipe` into `writer`, shutting it down on clean EOF.
pub async fn copy_from_pipe<W>(
    pipe: &mut PipeReader,
    writer: &mut W,
    timer: &ActivityTimer,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    while let Some(chunk) = pipe.read().await? {
        if let Err(e) = writer.write_all(&chunk).await {
            pipe.release();
            return Err(e);
        }
        total += chunk.len() as u64;
        timer.update();
    }
    writer.shutdown().await?;
    trace!("copied {} bytes out of pipe", total);
    Ok(total)
}

/// Pumps a client stream through the listener's half of a ray until both
/// directions finish. Returns `(uploaded, downloaded)` byte counts.
///
/// If either direction fails or the connection goes quiet past `timeouts`,
/// both pipe ends are released.
pub async fn copy_bidirectional<S>(
    stream: S,
    input: PipeWriter,
    output: PipeReader,
) -> io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite,
{
    copy_bidirectional_with(stream, input, output, Timeouts::default()).await
}

pub async fn copy_bidirectional_with<S>(
    stream: S,
    mut input: PipeWriter,
    mut output: PipeReader,
    timeouts: Timeouts,
) -> io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let timer = ActivityTimer::new(timeouts.idle);
    let result = relay(
        &timer,
        timeouts,
        copy_to_pipe(&mut reader, &mut input, &timer),
        copy_from_pipe(&mut output, &mut writer, &timer),
    )
    .await;
    if result.is_err() {
        input.release();
        output.release();
    }
    result
}

/// Whether an error just means the peer went away early.
pub fn is_early_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::{io::duplex, time::timeout};

    use super::*;
    use crate::ray::{pipe, PipeError, PipeState};

    fn short() -> Timeouts {
        Timeouts {
            idle: Duration::from_secs(30),
            uplink_only: Duration::from_millis(200),
            downlink_only: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (client, server) = duplex(64);
        let (input_writer, mut input_reader) = pipe(4);
        let (mut output_writer, output_reader) = pipe(4);

        let relay = tokio::spawn(copy_bidirectional(server, input_writer, output_reader));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut received = Vec::new();
        while let Some(chunk) = input_reader.read().await.unwrap() {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"ping");

        output_writer.write(Bytes::from("pong")).await.unwrap();
        output_writer.close();

        let mut reply = Vec::new();
        client_read.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        assert_eq!(relay.await.unwrap().unwrap(), (4, 4));
    }

    #[tokio::test]
    async fn released_output_surfaces_as_early_close() {
        let (_client, server) = duplex(64);
        let (input_writer, mut input_reader) = pipe(4);
        let (output_writer, output_reader) = pipe(4);
        output_writer.release();

        let err = copy_bidirectional(server, input_writer, output_reader)
            .await
            .unwrap_err();
        assert!(is_early_close(&err));
        assert_eq!(input_reader.read().await, Err(PipeError::Released));
    }

    #[tokio::test]
    async fn quiet_download_after_client_leaves_is_released() {
        let (mut client, server) = duplex(64);
        let (input_writer, mut input_reader) = pipe(4);
        let (output_writer, output_reader) = pipe(4);

        let relay = tokio::spawn(copy_bidirectional_with(
            server,
            input_writer,
            output_reader,
            short(),
        ));
        client.write_all(b"req").await.unwrap();
        drop(client);

        assert_eq!(input_reader.read().await.unwrap(), Some(Bytes::from("req")));
        assert_eq!(input_reader.read().await.unwrap(), None);

        // the upstream never answers
        let err = timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(output_writer.state(), PipeState::Released);
    }

    #[tokio::test]
    async fn traffic_keeps_the_timer_alive() {
        let timer = ActivityTimer::new(Duration::from_millis(200));
        let ticking = {
            let timer = timer.clone();
            async move {
                for _ in 0..6 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    timer.update();
                }
            }
        };
        tokio::select! {
            _ = ticking => {}
            _ = timer.expired() => panic!("expired while traffic was flowing"),
        }
        timeout(Duration::from_secs(1), timer.expired()).await.unwrap();
    }

    #[tokio::test]
    async fn shorter_limit_takes_effect_immediately() {
        let timer = ActivityTimer::new(Duration::from_secs(300));
        let waiting = {
            let timer = timer.clone();
            tokio::spawn(async move { timer.expired().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        timer.set_timeout(Duration::from_millis(50));
        timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
    }
}
