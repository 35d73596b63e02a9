// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Single-writer, many-reader byte broadcast
//!
//! Every reader attached through [Fanout::tee] receives each chunk written
//! after it attached, in write order. A writer with nobody to write to waits
//! until someone attaches, so no input is consumed into the void. Readers
//! which go away are quietly evicted on the next write.
use std::{
  io,
  pin::Pin,
  sync::{Mutex, MutexGuard, PoisonError},
  task::{Context, Poll},
};

use bytes::Bytes;
use tokio::{
  io::{AsyncRead, ReadBuf},
  sync::{mpsc, Notify},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

/// Chunks buffered per reader before the writer waits on it
pub const SUBSCRIBER_BUFFER: usize = 64;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutError {
  #[error("fanout is closed")]
  Closed,
}

impl From<FanoutError> for io::Error {
  fn from(error: FanoutError) -> Self {
    io::Error::new(io::ErrorKind::BrokenPipe, error)
  }
}

struct Subscriber {
  id: u64,
  sender: mpsc::Sender<io::Result<Bytes>>,
}

#[derive(Default)]
struct State {
  subscribers: Vec<Subscriber>,
  closed: bool,
  next_id: u64,
}

#[derive(Default)]
pub struct Fanout {
  state: Mutex<State>,
  attached: Notify,
  write_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Fanout {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.lock_state();
    f.debug_struct("Fanout")
      .field("subscribers", &state.subscribers.len())
      .field("closed", &state.closed)
      .finish()
  }
}

impl Fanout {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock_state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Attaches a new reader, waking any writer blocked for lack of readers
  ///
  /// A reader attached after [Fanout::close] reads EOF immediately.
  pub fn tee(&self) -> FanoutReader {
    let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
    {
      let mut state = self.lock_state();
      if !state.closed {
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, sender });
      }
    }
    self.attached.notify_waiters();
    FanoutReader::new(receiver)
  }

  #[cfg(test)]
  pub(crate) fn subscriber_count(&self) -> usize {
    self.lock_state().subscribers.len()
  }

  /// Delivers `data` to every attached reader
  ///
  /// Blocks while no readers are attached, and fails once the fanout closes.
  /// Readers which fail to accept the chunk are evicted; the write still
  /// reports the full length.
  pub async fn write(&self, data: &[u8]) -> Result<usize, FanoutError> {
    let _writing = self.write_lock.lock().await;
    let recipients = loop {
      let attached = {
        let state = self.lock_state();
        if state.closed {
          return Err(FanoutError::Closed);
        }
        if !state.subscribers.is_empty() {
          break state
            .subscribers
            .iter()
            .map(|subscriber| (subscriber.id, subscriber.sender.clone()))
            .collect::<Vec<_>>();
        }
        // Registered while the lock is held, so an attach cannot slip past
        self.attached.notified()
      };
      tracing::trace!("fanout write waiting for a reader");
      attached.await;
    };

    let chunk = Bytes::copy_from_slice(data);
    let mut evicted = Vec::new();
    for (id, sender) in recipients {
      if sender.send(Ok(chunk.clone())).await.is_err() {
        evicted.push(id);
      }
    }
    if !evicted.is_empty() {
      tracing::trace!(count = evicted.len(), "evicting departed fanout readers");
      self
        .lock_state()
        .subscribers
        .retain(|subscriber| !evicted.contains(&subscriber.id));
    }
    Ok(data.len())
  }

  /// Closes the fanout; attached readers see EOF once drained
  ///
  /// Blocked and future writes fail with [FanoutError::Closed].
  pub fn close(&self) {
    let detached = {
      let mut state = self.lock_state();
      state.closed = true;
      std::mem::take(&mut state.subscribers)
    };
    drop(detached);
    self.attached.notify_waiters();
  }
}

/// A reader attached to a [Fanout]
pub struct FanoutReader {
  inner: StreamReader<ReceiverStream<io::Result<Bytes>>, Bytes>,
}

impl FanoutReader {
  fn new(receiver: mpsc::Receiver<io::Result<Bytes>>) -> Self {
    Self {
      inner: StreamReader::new(ReceiverStream::new(receiver)),
    }
  }
}

impl AsyncRead for FanoutReader {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}
