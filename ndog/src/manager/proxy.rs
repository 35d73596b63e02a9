// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use tracing_futures::Instrument;

use super::{StreamError, StreamManager};
use crate::{
  scheme::{Config, ConnectConfig, Scheme},
  stream::{pipe, Stream},
};

/// Relays each listener-side peer to a fresh outbound connection
///
/// Every new stream is one end of a pair of pipes; the other end is handed to
/// the connect side of `scheme`, which runs in the background for as long as
/// the outbound connection lasts.
pub struct ProxyStreamManager {
  scheme: Arc<dyn Scheme>,
  config: Config,
}

impl ProxyStreamManager {
  pub fn new(scheme: Arc<dyn Scheme>, config: Config) -> Result<Self, StreamError> {
    let connector = scheme
      .connector()
      .ok_or_else(|| StreamError::NotConnectable(config.endpoint.scheme().to_string()))?;
    connector
      .check_options(&config.options)
      .map_err(|source| StreamError::Options {
        scheme: config.endpoint.scheme().to_string(),
        source,
      })?;
    Ok(Self { scheme, config })
  }
}

impl StreamManager for ProxyStreamManager {
  fn new_stream(&self, name: &str) -> Result<Stream, StreamError> {
    let connector = self
      .scheme
      .connector()
      .ok_or_else(|| StreamError::NotConnectable(self.config.endpoint.scheme().to_string()))?;
    // Listener side writes into `toward_remote`, connector side into `toward_peer`
    let (from_peer, toward_remote) = pipe();
    let (from_remote, toward_peer) = pipe();
    let listen_side = Stream::from_parts(from_remote, toward_remote);
    let connect_side = Stream::from_parts(from_peer, toward_peer);

    let span = tracing::debug_span!("proxy", stream = name, remote = %self.config.endpoint);
    span.in_scope(|| tracing::debug!("opening outbound connection"));
    let connecting = connector.connect(ConnectConfig {
      config: self.config.clone(),
      stream: connect_side,
    });
    tokio::task::spawn(
      async move {
        match connecting.await {
          Ok(()) => tracing::debug!("outbound connection finished"),
          Err(e) => tracing::error!(error = ?e, "outbound connection failed"),
        }
      }
      .instrument(span),
    );
    Ok(listen_side)
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use futures::{future::BoxFuture, FutureExt};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::ProxyStreamManager;
  use crate::{
    manager::{StreamError, StreamManager},
    scheme::{tcp::TcpScheme, Config, ConnectConfig, Connector, Endpoint, Options, Scheme},
  };

  const TIMEOUT: Duration = Duration::from_secs(5);

  /// Echoes everything the proxied peer sends, prefixed
  struct EchoScheme;

  impl Scheme for EchoScheme {
    fn names(&self) -> &'static [&'static str] {
      &["echo"]
    }

    fn description(&self) -> &'static str {
      "in-process echo"
    }

    fn connector(&self) -> Option<&dyn Connector> {
      Some(self)
    }
  }

  impl Connector for EchoScheme {
    fn connect(&self, config: ConnectConfig) -> BoxFuture<'static, anyhow::Result<()>> {
      async move {
        let (mut reader, mut writer) = config.stream.into_split();
        writer.write_all(b"echo: ").await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.close().await?;
        Ok(())
      }
      .boxed()
    }
  }

  struct RefusingScheme;

  impl Scheme for RefusingScheme {
    fn names(&self) -> &'static [&'static str] {
      &["refuse"]
    }

    fn description(&self) -> &'static str {
      "fails every connection"
    }

    fn connector(&self) -> Option<&dyn Connector> {
      Some(self)
    }
  }

  impl Connector for RefusingScheme {
    fn connect(&self, _config: ConnectConfig) -> BoxFuture<'static, anyhow::Result<()>> {
      async { anyhow::bail!("connection refused") }.boxed()
    }
  }

  struct ListenOnlyScheme;

  impl Scheme for ListenOnlyScheme {
    fn names(&self) -> &'static [&'static str] {
      &["listen-only"]
    }

    fn description(&self) -> &'static str {
      "cannot connect"
    }
  }

  fn config(url: &str) -> Config {
    Config::new(Endpoint::parse(url).unwrap())
  }

  #[tokio::test]
  async fn peer_is_relayed_through_connector() {
    let manager = ProxyStreamManager::new(Arc::new(EchoScheme), config("echo://remote:1")).unwrap();
    let mut stream = manager.new_stream("peer").unwrap();
    stream.writer.write_all(b"hello proxy").await.unwrap();
    stream.writer.close().await.unwrap();
    let mut read = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.reader.read_to_end(&mut read))
      .await
      .expect("proxied stream must finish")
      .unwrap();
    assert_eq!(read, b"echo: hello proxy");
  }

  #[tokio::test]
  async fn failed_connect_ends_the_stream() {
    let manager =
      ProxyStreamManager::new(Arc::new(RefusingScheme), config("refuse://remote:1")).unwrap();
    let mut stream = manager.new_stream("peer").unwrap();
    let mut read = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.reader.read_to_end(&mut read))
      .await
      .expect("stream must see EOF after the connect fails")
      .unwrap();
    assert!(read.is_empty());
  }

  #[test]
  fn scheme_without_connector_is_rejected() {
    assert!(
      ProxyStreamManager::new(Arc::new(ListenOnlyScheme), config("listen-only://x:1")).is_err()
    );
  }

  #[test]
  fn unknown_connect_options_fail_before_any_peer() {
    let mut options = Options::new();
    options.insert("bogus", "1");
    let err = ProxyStreamManager::new(
      Arc::new(TcpScheme),
      config("tcp://127.0.0.1:9").with_options(options),
    )
    .err()
    .expect("unknown options must be rejected");
    match err {
      StreamError::Options { scheme, source } => {
        assert_eq!(scheme, "tcp");
        assert_eq!(source.to_string(), "unknown options: bogus");
      }
      other => panic!("unexpected error: {}", other),
    }
  }
}
