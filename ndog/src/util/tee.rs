// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Duplicating adapters for async byte streams
//!
//! Both adapters forward every byte of the primary flow to a secondary "tap"
//! writer. The tap is best-effort: once it fails or stops accepting data it is
//! detached, and the primary flow continues unaffected.
use std::{
  io,
  pin::Pin,
  task::{ready, Context, Poll},
};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Pushes `pending` into `tap`, dropping the tap on failure
fn poll_drain<T>(tap: &mut Option<T>, pending: &mut Vec<u8>, cx: &mut Context<'_>) -> Poll<()>
where
  T: AsyncWrite + Unpin,
{
  while !pending.is_empty() {
    let Some(target) = tap.as_mut() else {
      pending.clear();
      break;
    };
    match Pin::new(target).poll_write(cx, pending) {
      Poll::Pending => return Poll::Pending,
      Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => {
        tracing::trace!("tee tap detached");
        *tap = None;
        pending.clear();
      }
      Poll::Ready(Ok(written)) => {
        pending.drain(..written);
      }
    }
  }
  Poll::Ready(())
}

pin_project! {
  /// Reads from `inner`, copying everything read into a tap writer
  pub struct TeeReader<R, T> {
    #[pin]
    inner: R,
    tap: Option<T>,
    pending: Vec<u8>,
  }
}

impl<R, T> TeeReader<R, T> {
  pub fn new(inner: R, tap: T) -> Self {
    Self {
      inner,
      tap: Some(tap),
      pending: Vec::new(),
    }
  }
}

impl<R, T> AsyncRead for TeeReader<R, T>
where
  R: AsyncRead,
  T: AsyncWrite + Unpin,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.project();
    // The tap sees each chunk before the reader is handed the next one
    ready!(poll_drain(this.tap, this.pending, cx));
    let filled_before = buf.filled().len();
    ready!(this.inner.poll_read(cx, buf))?;
    let fresh = &buf.filled()[filled_before..];
    if fresh.is_empty() {
      // EOF; release the tap so its reader observes the end as well
      this.tap.take();
    } else if this.tap.is_some() {
      this.pending.extend_from_slice(fresh);
      let _ = poll_drain(this.tap, this.pending, cx);
    }
    Poll::Ready(Ok(()))
  }
}

pin_project! {
  /// Writes to `inner`, copying everything accepted into a tap writer
  pub struct TeeWriter<W, T> {
    #[pin]
    inner: W,
    tap: Option<T>,
    pending: Vec<u8>,
  }
}

impl<W, T> TeeWriter<W, T> {
  pub fn new(inner: W, tap: T) -> Self {
    Self {
      inner,
      tap: Some(tap),
      pending: Vec::new(),
    }
  }
}

impl<W, T> AsyncWrite for TeeWriter<W, T>
where
  W: AsyncWrite,
  T: AsyncWrite + Unpin,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    let this = self.project();
    ready!(poll_drain(this.tap, this.pending, cx));
    let written = ready!(this.inner.poll_write(cx, buf))?;
    if this.tap.is_some() {
      this.pending.extend_from_slice(&buf[..written]);
      let _ = poll_drain(this.tap, this.pending, cx);
    }
    Poll::Ready(Ok(written))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.project();
    ready!(poll_drain(this.tap, this.pending, cx));
    if let Some(target) = this.tap.as_mut() {
      match Pin::new(target).poll_flush(cx) {
        Poll::Pending => return Poll::Pending,
        Poll::Ready(Err(_)) => *this.tap = None,
        Poll::Ready(Ok(())) => {}
      }
    }
    this.inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    let this = self.project();
    ready!(poll_drain(this.tap, this.pending, cx));
    if let Some(target) = this.tap.as_mut() {
      if Pin::new(target).poll_shutdown(cx).is_pending() {
        return Poll::Pending;
      }
      *this.tap = None;
    }
    this.inner.poll_shutdown(cx)
  }
}

pin_project! {
  /// A writer whose shutdown only flushes
  ///
  /// Used for process-wide sinks such as stdout, which many streams share
  /// and none of them may close.
  pub struct Unclosable<W> {
    #[pin]
    inner: W,
  }
}

impl<W> Unclosable<W> {
  pub fn new(inner: W) -> Self {
    Self { inner }
  }
}

impl<W: AsyncWrite> AsyncWrite for Unclosable<W> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }
}
