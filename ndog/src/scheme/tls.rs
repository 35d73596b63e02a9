// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::SystemTime};

use anyhow::Context;
use futures::{future::BoxFuture, FutureExt};
use rustls::{
  client::{ServerCertVerified, ServerCertVerifier},
  Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{ConnectConfig, Connector, ListenConfig, Listener, Scheme, TlsConfig};
use crate::{
  manager::StreamManager,
  net,
  runner::{accept_loop, bidirectional_copy, serve_connection},
  util::cancellation::ShutdownListener,
};

pub struct TlsScheme;

impl Scheme for TlsScheme {
  fn names(&self) -> &'static [&'static str] {
    &["tls"]
  }

  fn description(&self) -> &'static str {
    "Connect opens a TLS connection to the host and port in the URL,\n\
     verifying the server against the system roots unless told otherwise.\n\
     Listen accepts TLS connections on the host and port in the URL, using\n\
     --tls-cert/--tls-key, or a self-signed certificate for the URL host.\n\
     \n\
     Examples:\n  \
       Fetch a page: ndog -c tls://example.com:443 -d $'GET / HTTP/1.0\\r\\n\\r\\n'"
  }

  fn listener(&self) -> Option<&dyn Listener> {
    Some(self)
  }

  fn connector(&self) -> Option<&dyn Connector> {
    Some(self)
  }
}

impl Listener for TlsScheme {
  fn listen(&self, config: ListenConfig) -> BoxFuture<'static, anyhow::Result<()>> {
    listen(config).boxed()
  }
}

impl Connector for TlsScheme {
  fn connect(&self, config: ConnectConfig) -> BoxFuture<'static, anyhow::Result<()>> {
    connect(config).boxed()
  }
}

/// Accepts any server certificate
struct NoVerification;

impl ServerCertVerifier for NoVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &Certificate,
    _intermediates: &[Certificate],
    _server_name: &ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: SystemTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }
}

pub fn client_config(tls: &TlsConfig) -> anyhow::Result<ClientConfig> {
  let builder = ClientConfig::builder().with_safe_defaults();
  if tls.skip_verify {
    tracing::warn!("TLS certificate verification is disabled");
    return Ok(
      builder
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth(),
    );
  }
  let mut roots = RootCertStore::empty();
  for cert in rustls_native_certs::load_native_certs().context("failed to load system roots")? {
    if let Err(e) = roots.add(&Certificate(cert.0)) {
      tracing::debug!(error = %e, "skipping unusable system root");
    }
  }
  if let Some(path) = &tls.ca_cert {
    tracing::debug!(path = %path.display(), "loading CA certificates");
    for cert in load_certs(path)? {
      roots
        .add(&cert)
        .with_context(|| format!("invalid CA certificate in {}", path.display()))?;
    }
  }
  Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<Certificate>> {
  let mut reader = BufReader::new(
    File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
  );
  let certs = rustls_pemfile::certs(&mut reader)
    .with_context(|| format!("failed to parse {}", path.display()))?;
  if certs.is_empty() {
    anyhow::bail!("no certificates found in {}", path.display());
  }
  Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKey> {
  let mut reader = BufReader::new(
    File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
  );
  loop {
    match rustls_pemfile::read_one(&mut reader)
      .with_context(|| format!("failed to parse {}", path.display()))?
    {
      Some(rustls_pemfile::Item::PKCS8Key(key))
      | Some(rustls_pemfile::Item::RSAKey(key))
      | Some(rustls_pemfile::Item::ECKey(key)) => return Ok(PrivateKey(key)),
      Some(_) => continue,
      None => anyhow::bail!("no private key found in {}", path.display()),
    }
  }
}

/// Serves the configured certificate, or a self-signed one for `hostname`
pub fn server_config(tls: &TlsConfig, hostname: &str) -> anyhow::Result<ServerConfig> {
  let (certs, key) = match (&tls.cert, &tls.key) {
    (Some(cert), Some(key)) => (load_certs(cert)?, load_key(key)?),
    (None, None) => {
      tracing::info!(hostname, "generating self-signed certificate");
      let generated = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
        .context("failed to generate certificate")?;
      (
        vec![Certificate(generated.serialize_der()?)],
        PrivateKey(generated.serialize_private_key_der()),
      )
    }
    _ => anyhow::bail!("a TLS certificate and key must be given together"),
  };
  ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("invalid certificate or key")
}

pub async fn listen(config: ListenConfig) -> anyhow::Result<()> {
  let ListenConfig {
    config,
    streams,
    shutdown,
  } = config;
  config.options.done()?;
  let addr = config.endpoint.host_port()?;
  let acceptor = TlsAcceptor::from(Arc::new(server_config(
    &config.tls,
    config.endpoint.hostname()?,
  )?));
  let listener = net::bind_tcp(&addr, &config.net)
    .await
    .with_context(|| format!("failed to listen on {}", addr))?;
  tracing::info!(addr = %listener.local_addr()?, "listening");
  serve(listener, acceptor, streams, shutdown).await;
  Ok(())
}

/// Serves TLS peers from an already-bound listener until shutdown
pub async fn serve(
  listener: TcpListener,
  acceptor: TlsAcceptor,
  streams: Arc<dyn StreamManager>,
  shutdown: ShutdownListener,
) {
  accept_loop(listener, shutdown, move |conn, peer| {
    let acceptor = acceptor.clone();
    let streams = Arc::clone(&streams);
    async move {
      match acceptor.accept(conn).await {
        Ok(conn) => serve_connection(conn, peer.to_string(), streams).await,
        Err(e) => tracing::warn!(error = %e, "TLS handshake failed"),
      }
    }
  })
  .await
}

pub async fn connect(config: ConnectConfig) -> anyhow::Result<()> {
  let ConnectConfig { config, stream } = config;
  config.options.done()?;
  let addr = config.endpoint.host_port()?;
  let name = match &config.tls.server_name {
    Some(name) => name.as_str(),
    None => config.endpoint.hostname()?,
  };
  let server_name = ServerName::try_from(name)
    .with_context(|| format!("invalid TLS server name {:?}", name))?;
  let connector = TlsConnector::from(Arc::new(client_config(&config.tls)?));

  let tcp = TcpStream::connect(&addr)
    .await
    .with_context(|| format!("failed to connect to {}", addr))?;
  let remote = tcp.peer_addr()?;
  let conn = connector
    .connect(server_name, tcp)
    .await
    .with_context(|| format!("TLS handshake with {} failed", remote))?;
  tracing::info!(%remote, "connected");
  let stats = bidirectional_copy(conn, stream).await;
  tracing::info!(%remote, received = stats.received, sent = stats.sent, "closed");
  Ok(())
}
