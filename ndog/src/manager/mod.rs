// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Stream managers decide what each new peer talks to
//!
//! A scheme asks its manager for one [Stream] per peer (per accepted
//! connection, per UDP source address, or once for an outbound connection).
use std::{io, sync::Arc};

use crate::{scheme::OptionsError, stream::BoxWriter, util::tee::Unclosable};

pub mod exec;
pub mod log;
pub mod proxy;
pub mod stdio;

pub use crate::stream::Stream;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
  #[error("no command to execute")]
  EmptyCommand,
  #[error("failed to start `{program}`")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },
  #[error("subprocess {0} was not captured")]
  MissingPipe(&'static str),
  #[error("scheme `{0}` cannot connect")]
  NotConnectable(String),
  #[error("invalid options for `{scheme}`")]
  Options {
    scheme: String,
    #[source]
    source: OptionsError,
  },
}

pub trait StreamManager: Send + Sync {
  /// Produces the stream for a newly-seen peer
  ///
  /// `name` identifies the peer in logs and is not otherwise interpreted.
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError>;
}

impl<T: StreamManager + ?Sized> StreamManager for Arc<T> {
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
    (**self).new_stream(name)
  }
}

impl<T: StreamManager + ?Sized> StreamManager for Box<T> {
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
    (**self).new_stream(name)
  }
}

/// Produces the sink a stream's output is written to
pub type OutputFactory = Arc<dyn Fn() -> BoxWriter + Send + Sync>;

/// Process stdout, shared by every stream and never closed by any of them
pub fn stdout_output() -> OutputFactory {
  Arc::new(|| Box::new(Unclosable::new(tokio::io::stdout())))
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::{Arc, Mutex};

  use super::OutputFactory;
  use crate::stream::{pipe, BoxWriter, PipeReader};

  /// An output factory whose first product feeds the returned reader;
  /// later products discard their input.
  pub fn captured_output() -> (OutputFactory, PipeReader) {
    let (reader, writer) = pipe();
    let slot = Arc::new(Mutex::new(Some(writer)));
    let factory: OutputFactory = Arc::new(move || match slot.lock().unwrap().take() {
      Some(writer) => Box::new(writer) as BoxWriter,
      None => Box::new(tokio::io::sink()),
    });
    (factory, reader)
  }
}
