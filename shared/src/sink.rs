//! Line-buffered output targets.
//!
//! A `LineSink` is the explicit output of an engine: a network socket, the
//! local console, or an in-memory `Transcript`. Sinks are cheap to clone and
//! can be written to from several tasks at once; each line is written and
//! flushed under one lock so concurrent lines never interleave.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared, line-oriented writer. A sink without a writer is "disconnected"
/// and rejects writes with `NotConnected`.
#[derive(Clone)]
pub struct LineSink {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
}

impl fmt::Debug for LineSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineSink").finish_non_exhaustive()
    }
}

impl LineSink {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Sink for the process's standard output.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Sink with no writer yet; see [`LineSink::attach`].
    pub fn disconnected() -> Self {
        Self {
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Installs (or replaces) the underlying writer. Every clone of this sink
    /// sees the new writer.
    pub async fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.writer.lock().await = Some(Box::new(writer));
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Writes `line` followed by a newline (unless it already ends in one)
    /// and flushes.
    pub async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "output is closed"))?;

        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        if !line.ends_with('\n') {
            data.push('\n');
        }

        writer.write_all(data.as_bytes()).await?;
        writer.flush().await
    }

    /// Shuts the writer down and detaches it. Closing twice is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        let writer = self.writer.lock().await.take();
        match writer {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        }
    }
}

/// In-memory writer that records everything written to it.
///
/// Used wherever output has to be inspected after the fact: tests, and any
/// caller that wants to capture what an engine produced.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    buffer: Arc<StdMutex<Vec<u8>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink writing into this transcript.
    pub fn sink(&self) -> LineSink {
        LineSink::new(self.clone())
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl AsyncWrite for Transcript {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_line_appends_newline_once() {
        let transcript = Transcript::new();
        let sink = transcript.sink();

        sink.write_line("hello").await.unwrap();
        sink.write_line("already terminated\n").await.unwrap();

        assert_eq!(transcript.contents(), "hello\nalready terminated\n");
    }

    #[tokio::test]
    async fn test_disconnected_sink_rejects_writes() {
        let sink = LineSink::disconnected();
        assert!(!sink.is_connected().await);

        let err = sink.write_line("lost").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_attach_is_visible_to_clones() {
        let sink = LineSink::disconnected();
        let clone = sink.clone();
        let transcript = Transcript::new();

        sink.attach(transcript.clone()).await;
        clone.write_line("via clone").await.unwrap();

        assert_eq!(transcript.lines(), vec!["via clone"]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transcript = Transcript::new();
        let sink = transcript.sink();

        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert!(sink.write_line("after close").await.is_err());
        assert!(transcript.contents().is_empty());
    }
}
