// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Shutdown notice handed to listeners
///
/// Listeners may observe the shutdown request but cannot raise it themselves;
/// only the holder of the originating [CancellationToken] may do so.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct ShutdownListener {
  token: CancellationToken,
}

impl ShutdownListener {
  pub fn shutting_down(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for ShutdownListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Cancels `token` on the first interrupt signal
///
/// The returned task should be aborted once it is no longer relevant.
pub fn cancel_on_interrupt(token: CancellationToken) -> JoinHandle<()> {
  tokio::task::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        tracing::info!("interrupt received, shutting down");
        token.cancel();
      }
      Err(e) => tracing::warn!(error = %e, "unable to listen for interrupts"),
    }
  })
}
