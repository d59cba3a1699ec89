//! Abstract byte transport halves for hub connections.
//!
//! A physical connection is split into a [`ByteSource`] (read side, owned by
//! the receive loop) and a [`ByteSink`] (write side, owned by the session's
//! send lock). Both WebSocket and raw stream connections implement these.

use crate::error::{RelayError, RelayResult};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read half of a byte transport.
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. Returns number of bytes read, 0 = EOF.
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, RelayResult<usize>>;
}

/// Write half of a byte transport.
pub trait ByteSink: Send {
    /// Write all bytes.
    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, RelayResult<()>>;

    /// Close the write side. Called at most once by [`crate::channel::ChannelSender`].
    fn close(&mut self) -> BoxFuture<'_, RelayResult<()>>;
}

/// [`ByteSource`] over any tokio reader.
pub struct IoSource<R> {
    inner: R,
}

impl<R> IoSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: AsyncRead + Unpin + Send> ByteSource for IoSource<R> {
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> BoxFuture<'a, RelayResult<usize>> {
        Box::pin(async move {
            self.inner
                .read(buf)
                .await
                .map_err(|e| RelayError::Transport(format!("read failed: {e}")))
        })
    }
}

/// [`ByteSink`] over any tokio writer.
pub struct IoSink<W> {
    inner: W,
}

impl<W> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin + Send> ByteSink for IoSink<W> {
    fn write_all<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            self.inner
                .write_all(data)
                .await
                .map_err(|e| RelayError::Transport(format!("write failed: {e}")))?;
            self.inner
                .flush()
                .await
                .map_err(|e| RelayError::Transport(format!("flush failed: {e}")))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            self.inner
                .shutdown()
                .await
                .map_err(|e| RelayError::Transport(format!("shutdown failed: {e}")))
        })
    }
}
