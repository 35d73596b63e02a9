// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional byte streams with independently closable halves
use std::{
  fmt::Debug,
  io,
  pin::Pin,
  task::{ready, Context, Poll},
};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use crate::util::dropkick::{close_hook, CloseHook};

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin + 'static>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin + 'static>;

/// Bytes a pipe buffers before its writer blocks
pub const PIPE_CAPACITY: usize = 64 * 1024;

pub type PipeReader = tokio::io::ReadHalf<DuplexStream>;
pub type PipeWriter = tokio::io::WriteHalf<DuplexStream>;

/// An in-memory, bounded, one-directional byte pipe
///
/// Closing (or dropping) the writer delivers EOF to the reader; closing the
/// reader makes further writes fail with [io::ErrorKind::BrokenPipe].
pub fn pipe() -> (PipeReader, PipeWriter) {
  let (reading_end, writing_end) = tokio::io::duplex(PIPE_CAPACITY);
  let (reader, _) = tokio::io::split(reading_end);
  let (_, writer) = tokio::io::split(writing_end);
  (reader, writer)
}

fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::BrokenPipe, "stream half is closed")
}

/// True for errors which indicate the other side went away rather than a fault
pub fn is_closed_error(error: &io::Error) -> bool {
  matches!(
    error.kind(),
    io::ErrorKind::BrokenPipe
      | io::ErrorKind::ConnectionReset
      | io::ErrorKind::ConnectionAborted
      | io::ErrorKind::NotConnected
      | io::ErrorKind::UnexpectedEof
  )
}

/// The readable half of a [Stream]
///
/// Closing is idempotent and also happens on drop. Reads after closing fail.
pub struct ReadHalf {
  inner: Option<BoxReader>,
  on_close: Option<CloseHook>,
}

impl ReadHalf {
  pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
    Self {
      inner: Some(Box::new(reader)),
      on_close: None,
    }
  }

  /// Runs `hook` once, when this half is closed or dropped
  pub fn with_close_hook(
    reader: impl AsyncRead + Send + Unpin + 'static,
    hook: impl FnOnce() + Send + 'static,
  ) -> Self {
    Self {
      inner: Some(Box::new(reader)),
      on_close: Some(close_hook(hook)),
    }
  }

  pub fn close(&mut self) {
    // Release the underlying reader before notifying
    drop(self.inner.take());
    if let Some(mut hook) = self.on_close.take() {
      hook.kick();
    }
  }

  pub fn is_closed(&self) -> bool {
    self.inner.is_none()
  }
}

impl Debug for ReadHalf {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReadHalf")
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl AsyncRead for ReadHalf {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    match self.inner.as_mut() {
      Some(inner) => Pin::new(inner).poll_read(cx, buf),
      None => Poll::Ready(Err(closed_error())),
    }
  }
}

/// The writable half of a [Stream]
///
/// Closing shuts the underlying writer down, signalling EOF to whoever reads
/// it, then releases it. Closing is idempotent; dropping releases without the
/// graceful shutdown.
pub struct WriteHalf {
  inner: Option<BoxWriter>,
  on_close: Option<CloseHook>,
}

impl WriteHalf {
  pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
    Self {
      inner: Some(Box::new(writer)),
      on_close: None,
    }
  }

  /// Runs `hook` once, when this half is closed or dropped
  pub fn with_close_hook(
    writer: impl AsyncWrite + Send + Unpin + 'static,
    hook: impl FnOnce() + Send + 'static,
  ) -> Self {
    Self {
      inner: Some(Box::new(writer)),
      on_close: Some(close_hook(hook)),
    }
  }

  pub async fn close(&mut self) -> io::Result<()> {
    self.shutdown().await
  }

  pub fn is_closed(&self) -> bool {
    self.inner.is_none()
  }

  fn release(&mut self) {
    drop(self.inner.take());
    if let Some(mut hook) = self.on_close.take() {
      hook.kick();
    }
  }
}

impl Debug for WriteHalf {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WriteHalf")
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl AsyncWrite for WriteHalf {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    match self.inner.as_mut() {
      Some(inner) => Pin::new(inner).poll_write(cx, buf),
      None => Poll::Ready(Err(closed_error())),
    }
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    match self.inner.as_mut() {
      Some(inner) => Pin::new(inner).poll_flush(cx),
      None => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let result = match self.inner.as_mut() {
      Some(inner) => ready!(Pin::new(inner).poll_shutdown(cx)),
      None => Ok(()),
    };
    self.release();
    Poll::Ready(result)
  }
}

/// A pair of independently closable halves: bytes for the peer come out of
/// `reader`, bytes from the peer go into `writer`
#[derive(Debug)]
pub struct Stream {
  pub reader: ReadHalf,
  pub writer: WriteHalf,
}

impl Stream {
  pub fn new(reader: ReadHalf, writer: WriteHalf) -> Self {
    Self { reader, writer }
  }

  pub fn from_parts(
    reader: impl AsyncRead + Send + Unpin + 'static,
    writer: impl AsyncWrite + Send + Unpin + 'static,
  ) -> Self {
    Self::new(ReadHalf::new(reader), WriteHalf::new(writer))
  }

  /// Closes both halves; any shutdown failure of the writer is returned
  pub async fn close(&mut self) -> io::Result<()> {
    self.reader.close();
    self.writer.close().await
  }

  pub fn into_split(self) -> (ReadHalf, WriteHalf) {
    (self.reader, self.writer)
  }
}

/// Serializes `value` as a single line of JSON
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
  W: AsyncWrite + Unpin + ?Sized,
  T: Serialize + ?Sized,
{
  let mut line = serde_json::to_vec(value)?;
  line.push(b'\n');
  writer.write_all(&line).await?;
  writer.flush().await
}
