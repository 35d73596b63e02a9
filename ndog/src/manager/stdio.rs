// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{io::Cursor, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{stdout_output, OutputFactory, StreamError, StreamManager};
use crate::{
  fanout::Fanout,
  stream::{is_closed_error, ReadHalf, Stream, WriteHalf},
};

const PUMP_BUFFER: usize = 32 * 1024;

enum Input {
  /// Every stream reads its own copy of the same bytes
  Fixed(Bytes),
  /// Streams share one live input, each seeing what arrives after it starts
  Live(Arc<Fanout>),
}

/// Connects every peer to the process's own input and output
///
/// Peer output is written to a shared sink (stdout by default). Input is
/// either fixed data replayed to each stream, or a live source which is
/// broadcast to all streams open at the time.
pub struct StdIoStreamManager {
  input: Input,
  output: OutputFactory,
}

impl StdIoStreamManager {
  /// Broadcasts process stdin to every stream
  pub fn from_stdin() -> Self {
    Self::from_reader(tokio::io::stdin())
  }

  /// Broadcasts `source` to every stream
  ///
  /// Must be called within a Tokio runtime; a task pumps `source` until EOF.
  pub fn from_reader(source: impl AsyncRead + Send + Unpin + 'static) -> Self {
    let fanout = Arc::new(Fanout::new());
    tokio::task::spawn(pump_input(source, Arc::clone(&fanout)));
    Self {
      input: Input::Live(fanout),
      output: stdout_output(),
    }
  }

  /// Replays `data` to each stream in full, then EOF
  pub fn with_data(data: impl Into<Bytes>) -> Self {
    Self {
      input: Input::Fixed(data.into()),
      output: stdout_output(),
    }
  }

  pub fn with_output(mut self, output: OutputFactory) -> Self {
    self.output = output;
    self
  }
}

async fn pump_input(mut source: impl AsyncRead + Unpin, fanout: Arc<Fanout>) {
  let mut buffer = vec![0u8; PUMP_BUFFER];
  loop {
    match source.read(&mut buffer).await {
      Ok(0) => {
        tracing::debug!("input reached EOF");
        break;
      }
      Ok(read) => {
        if let Err(e) = fanout.write(&buffer[..read]).await {
          tracing::debug!(error = %e, "input fanout stopped");
          break;
        }
      }
      Err(e) if is_closed_error(&e) => {
        tracing::debug!(error = %e, "input closed");
        break;
      }
      Err(e) => {
        tracing::error!(error = %e, "input read error");
        break;
      }
    }
  }
  fanout.close();
}

impl StreamManager for StdIoStreamManager {
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
    tracing::trace!(stream = name, "new stdio stream");
    let reader = match &self.input {
      Input::Fixed(data) => ReadHalf::new(Cursor::new(data.clone())),
      Input::Live(fanout) => ReadHalf::new(fanout.tee()),
    };
    Ok(Stream::new(reader, WriteHalf::new((self.output)())))
  }
}
