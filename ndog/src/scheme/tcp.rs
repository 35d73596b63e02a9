// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use anyhow::Context;
use futures::{future::BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream};

use super::{ConnectConfig, Connector, ListenConfig, Listener, Scheme};
use crate::{
  manager::StreamManager,
  net,
  runner::{accept_loop, bidirectional_copy, serve_connection},
  util::cancellation::ShutdownListener,
};

pub struct TcpScheme;

impl Scheme for TcpScheme {
  fn names(&self) -> &'static [&'static str] {
    &["tcp"]
  }

  fn description(&self) -> &'static str {
    "Connect opens a TCP connection to the host and port in the URL.\n\
     Listen accepts TCP connections on the host and port in the URL,\n\
     giving each connection its own stream.\n\
     \n\
     Examples:\n  \
       Echo server: ndog -l tcp://localhost:8080 -x cat"
  }

  fn listener(&self) -> Option<&dyn Listener> {
    Some(self)
  }

  fn connector(&self) -> Option<&dyn Connector> {
    Some(self)
  }
}

impl Listener for TcpScheme {
  fn listen(&self, config: ListenConfig) -> BoxFuture<'static, anyhow::Result<()>> {
    listen(config).boxed()
  }
}

impl Connector for TcpScheme {
  fn connect(&self, config: ConnectConfig) -> BoxFuture<'static, anyhow::Result<()>> {
    connect(config).boxed()
  }
}

pub async fn listen(config: ListenConfig) -> anyhow::Result<()> {
  let ListenConfig {
    config,
    streams,
    shutdown,
  } = config;
  config.options.done()?;
  let addr = config.endpoint.host_port()?;
  let listener = net::bind_tcp(&addr, &config.net)
    .await
    .with_context(|| format!("failed to listen on {}", addr))?;
  tracing::info!(addr = %listener.local_addr()?, "listening");
  serve(listener, streams, shutdown).await;
  Ok(())
}

/// Serves plain TCP peers from an already-bound listener until shutdown
pub async fn serve(
  listener: TcpListener,
  streams: Arc<dyn StreamManager>,
  shutdown: ShutdownListener,
) {
  accept_loop(listener, shutdown, move |conn, peer| {
    serve_connection(conn, peer.to_string(), Arc::clone(&streams))
  })
  .await
}

pub async fn connect(config: ConnectConfig) -> anyhow::Result<()> {
  let ConnectConfig { config, stream } = config;
  config.options.done()?;
  let addr = config.endpoint.host_port()?;
  let conn = TcpStream::connect(&addr)
    .await
    .with_context(|| format!("failed to connect to {}", addr))?;
  let remote = conn.peer_addr()?;
  tracing::info!(%remote, "connected");
  let stats = bidirectional_copy(conn, stream).await;
  tracing::info!(%remote, received = stats.received, sent = stats.sent, "closed");
  Ok(())
}
