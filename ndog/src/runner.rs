// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The per-peer relay shared by connection-oriented schemes
use std::{future::Future, io, net::SocketAddr, sync::Arc};

use futures::StreamExt;
use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  manager::StreamManager,
  stream::{is_closed_error, Stream},
  util::cancellation::ShutdownListener,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
  /// Bytes copied from the connection into the stream
  pub received: u64,
  /// Bytes copied from the stream onto the connection
  pub sent: u64,
}

fn report(direction: &'static str, result: &io::Result<u64>) {
  match result {
    Ok(bytes) => tracing::trace!(direction, bytes, "copy finished"),
    Err(e) if is_closed_error(e) => tracing::debug!(direction, error = %e, "copy closed"),
    Err(e) => tracing::error!(direction, error = %e, "copy failed"),
  }
}

fn torn_down() -> io::Error {
  io::Error::new(io::ErrorKind::ConnectionAborted, "opposite direction failed")
}

/// Relays `conn` and `stream` in both directions until both are finished
///
/// Each direction half-closes its destination when its source reaches EOF,
/// leaving the other direction running. A failure in either direction tears
/// both down. The stream is fully closed on return.
pub async fn bidirectional_copy<C>(conn: C, stream: Stream) -> CopyStats
where
  C: AsyncRead + AsyncWrite,
{
  let (mut conn_reader, mut conn_writer) = tokio::io::split(conn);
  let (mut reader, mut writer) = stream.into_split();
  let failed = CancellationToken::new();

  let inbound = async {
    let result = tokio::select! {
      result = tokio::io::copy(&mut conn_reader, &mut writer) => result,
      _ = failed.cancelled() => Err(torn_down()),
    };
    report("read", &result);
    if result.is_err() {
      failed.cancel();
    }
    if let Err(e) = writer.close().await {
      tracing::debug!(error = %e, "stream writer close failed");
    }
    result.unwrap_or(0)
  };

  let outbound = async {
    let result = tokio::select! {
      result = tokio::io::copy(&mut reader, &mut conn_writer) => result,
      _ = failed.cancelled() => Err(torn_down()),
    };
    report("write", &result);
    if result.is_err() {
      failed.cancel();
    }
    reader.close();
    if let Err(e) = conn_writer.shutdown().await {
      tracing::debug!(error = %e, "connection shutdown failed");
    }
    result.unwrap_or(0)
  };

  let (received, sent) = futures::future::join(inbound, outbound).await;
  CopyStats { received, sent }
}

/// Pairs one accepted connection with a fresh stream and relays them
pub async fn serve_connection<C>(conn: C, peer: String, streams: Arc<dyn StreamManager>)
where
  C: AsyncRead + AsyncWrite,
{
  tracing::debug!("accepted");
  let stream = match streams.new_stream(&peer) {
    Ok(stream) => stream,
    Err(e) => {
      tracing::error!(error = ?e, "failed to create stream");
      return;
    }
  };
  let stats = bidirectional_copy(conn, stream).await;
  tracing::debug!(received = stats.received, sent = stats.sent, "closed");
}

/// Accepts connections until shutdown, handling each on its own task
pub async fn accept_loop<F, Fut>(
  listener: TcpListener,
  shutdown: ShutdownListener,
  mut handle: F,
) where
  F: FnMut(TcpStream, SocketAddr) -> Fut,
  Fut: Future<Output = ()> + Send + 'static,
{
  let incoming = TcpListenerStream::new(listener).take_until(shutdown.shutting_down());
  tokio::pin!(incoming);
  while let Some(accepted) = incoming.next().await {
    let conn = match accepted {
      Ok(conn) => conn,
      Err(e) => {
        tracing::error!(error = %e, "accept error");
        continue;
      }
    };
    let peer = match conn.peer_addr() {
      Ok(peer) => peer,
      Err(e) => {
        tracing::debug!(error = %e, "peer left before it was accepted");
        continue;
      }
    };
    let span = tracing::info_span!("conn", %peer);
    tokio::task::spawn(handle(conn, peer).instrument(span));
  }
  tracing::info!("stopped accepting connections");
}
