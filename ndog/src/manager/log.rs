// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Traffic logging around any other stream manager
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use super::{StreamError, StreamManager};
use crate::{
  stream::{pipe, PipeReader, ReadHalf, Stream, WriteHalf},
  util::tee::{TeeReader, TeeWriter},
};

/// Largest slice of traffic reported in one observation
pub const OBSERVED_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  /// Bytes which arrived from the peer
  Received,
  /// Bytes on their way to the peer
  Sent,
}

impl Direction {
  pub fn arrow(self) -> &'static str {
    match self {
      Direction::Received => "<-",
      Direction::Sent => "->",
    }
  }
}

pub trait IoObserver: Send + Sync {
  fn observe(&self, direction: Direction, stream: &str, chunk: &[u8]);
}

/// Reports traffic as `info` events under the `ndog::io` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl IoObserver for TracingObserver {
  fn observe(&self, direction: Direction, stream: &str, chunk: &[u8]) {
    tracing::info!(
      target: "ndog::io",
      "{}{} {:?}",
      direction.arrow(),
      stream,
      String::from_utf8_lossy(chunk)
    );
  }
}

/// Wraps another manager, reporting every chunk in either direction
///
/// The bytes themselves pass through unmodified.
pub struct LogStreamManager<M> {
  delegate: M,
  observer: Arc<dyn IoObserver>,
}

impl<M: StreamManager> LogStreamManager<M> {
  pub fn new(delegate: M) -> Self {
    Self::with_observer(delegate, Arc::new(TracingObserver))
  }

  pub fn with_observer(delegate: M, observer: Arc<dyn IoObserver>) -> Self {
    Self { delegate, observer }
  }
}

impl<M: StreamManager> StreamManager for LogStreamManager<M> {
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
    let (reader, writer) = self.delegate.new_stream(name)?.into_split();
    let (sent_tap, sent_tap_writer) = pipe();
    let (received_tap, received_tap_writer) = pipe();
    for (tap, direction) in [
      (sent_tap, Direction::Sent),
      (received_tap, Direction::Received),
    ] {
      tokio::task::spawn(report_tap(
        tap,
        direction,
        name.to_string(),
        Arc::clone(&self.observer),
      ));
    }
    Ok(Stream::new(
      ReadHalf::new(TeeReader::new(reader, sent_tap_writer)),
      WriteHalf::new(TeeWriter::new(writer, received_tap_writer)),
    ))
  }
}

async fn report_tap(
  mut tap: PipeReader,
  direction: Direction,
  stream: String,
  observer: Arc<dyn IoObserver>,
) {
  let mut chunk = vec![0u8; OBSERVED_CHUNK];
  loop {
    match tap.read(&mut chunk).await {
      Ok(0) | Err(_) => break,
      Ok(read) => observer.observe(direction, &stream, &chunk[..read]),
    }
  }
}
