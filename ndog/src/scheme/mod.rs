// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Protocol handlers, keyed by URL scheme
//!
//! A [Scheme] advertises which capabilities it has: it may be a [Listener],
//! a [Connector], or both. Handlers are selected by the base scheme of an
//! [Endpoint]; any `+subscheme` suffix is passed through as an opaque hint.
use std::{fmt::Display, path::PathBuf, sync::Arc};

use futures::future::BoxFuture;
use url::Url;

use crate::{
  manager::StreamManager,
  stream::Stream,
  util::cancellation::ShutdownListener,
};

pub mod options;
pub mod registry;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use options::{OptionHelp, Options, OptionsError, OptionsHelp};
pub use registry::SchemeRegistry;

#[derive(thiserror::Error, Debug)]
pub enum SchemeError {
  #[error("invalid URL `{input}`")]
  InvalidUrl {
    input: String,
    #[source]
    source: url::ParseError,
  },
  #[error("unknown scheme `{0}`")]
  Unknown(String),
  #[error("scheme `{scheme}` does not support {capability}")]
  Unsupported {
    scheme: String,
    capability: Capability,
  },
  #[error("scheme name `{0}` is already registered")]
  Conflict(&'static str),
  #[error("`{0}` has no host")]
  MissingHost(String),
  #[error("`{0}` has no port")]
  MissingPort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
  Listen,
  Connect,
}

impl Display for Capability {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Capability::Listen => "listen",
      Capability::Connect => "connect",
    })
  }
}

/// A parsed `<scheme>[+<subscheme>]://<host>[:<port>]...` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  url: Url,
  scheme: String,
  subscheme: Option<String>,
}

impl Endpoint {
  pub fn parse(input: &str) -> Result<Self, SchemeError> {
    let url = Url::parse(input).map_err(|source| SchemeError::InvalidUrl {
      input: input.to_string(),
      source,
    })?;
    Ok(Self::from_url(url))
  }

  pub fn from_url(url: Url) -> Self {
    let (scheme, subscheme) = match url.scheme().split_once('+') {
      Some((scheme, subscheme)) => (scheme.to_string(), Some(subscheme.to_string())),
      None => (url.scheme().to_string(), None),
    };
    Self {
      url,
      scheme,
      subscheme,
    }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// The base scheme, used for registry lookup
  pub fn scheme(&self) -> &str {
    &self.scheme
  }

  pub fn subscheme(&self) -> Option<&str> {
    self.subscheme.as_deref()
  }

  /// The host without IPv6 brackets, suitable for certificates and SNI
  pub fn hostname(&self) -> Result<&str, SchemeError> {
    match self.url.host_str() {
      Some(host) if !host.is_empty() => Ok(host.trim_start_matches('[').trim_end_matches(']')),
      _ => Err(SchemeError::MissingHost(self.url.to_string())),
    }
  }

  /// `host:port`, suitable for binding and dialing
  pub fn host_port(&self) -> Result<String, SchemeError> {
    let host = match self.url.host_str() {
      Some(host) if !host.is_empty() => host,
      _ => return Err(SchemeError::MissingHost(self.url.to_string())),
    };
    let port = self
      .url
      .port()
      .ok_or_else(|| SchemeError::MissingPort(self.url.to_string()))?;
    Ok(format!("{}:{}", host, port))
  }
}

impl Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    Display::fmt(&self.url, f)
  }
}

/// Socket-level settings shared by every listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetConfig {
  /// Bind with `SO_REUSEADDR` and `SO_REUSEPORT`
  pub reuse_port: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
  /// Accept any server certificate when connecting
  pub skip_verify: bool,
  /// Overrides the URL host for SNI and certificate verification
  pub server_name: Option<String>,
  /// PEM roots trusted in addition to the system roots when connecting
  pub ca_cert: Option<PathBuf>,
  /// PEM certificate chain served when listening
  pub cert: Option<PathBuf>,
  /// PEM private key matching `cert`
  pub key: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub endpoint: Endpoint,
  pub options: Options,
  pub net: NetConfig,
  pub tls: TlsConfig,
}

impl Config {
  pub fn new(endpoint: Endpoint) -> Self {
    Self {
      endpoint,
      options: Options::default(),
      net: NetConfig::default(),
      tls: TlsConfig::default(),
    }
  }

  pub fn with_options(mut self, options: Options) -> Self {
    self.options = options;
    self
  }
}

pub struct ListenConfig {
  pub config: Config,
  /// Source of one stream per peer
  pub streams: Arc<dyn StreamManager>,
  /// Listeners stop accepting once this fires
  pub shutdown: ShutdownListener,
}

pub struct ConnectConfig {
  pub config: Config,
  /// The stream to relay the outbound connection to
  pub stream: Stream,
}

pub trait Listener: Send + Sync {
  /// Serves peers until shut down or a fatal error occurs
  fn listen(&self, config: ListenConfig) -> BoxFuture<'static, anyhow::Result<()>>;
}

pub trait Connector: Send + Sync {
  /// Relays one outbound connection until either side finishes
  fn connect(&self, config: ConnectConfig) -> BoxFuture<'static, anyhow::Result<()>>;

  /// Rejects options [Connector::connect] would not consume
  ///
  /// Lets callers which connect once per peer report bad options up front.
  fn check_options(&self, options: &Options) -> Result<(), OptionsError> {
    options.clone().done()
  }
}

pub trait Scheme: Send + Sync {
  /// Names listed to users; the first is canonical
  fn names(&self) -> &'static [&'static str];

  /// Additional names which resolve to this scheme but are never listed
  fn hidden_names(&self) -> &'static [&'static str] {
    &[]
  }

  fn description(&self) -> &'static str;

  fn listener(&self) -> Option<&dyn Listener> {
    None
  }

  fn connector(&self) -> Option<&dyn Connector> {
    None
  }

  fn listen_options(&self) -> OptionsHelp {
    OptionsHelp::default()
  }

  fn connect_options(&self) -> OptionsHelp {
    OptionsHelp::default()
  }
}

impl dyn Scheme {
  pub fn capabilities(&self) -> Vec<Capability> {
    let mut capabilities = Vec::with_capacity(2);
    if self.listener().is_some() {
      capabilities.push(Capability::Listen);
    }
    if self.connector().is_some() {
      capabilities.push(Capability::Connect);
    }
    capabilities
  }

  pub fn require_listener(&self) -> Result<&dyn Listener, SchemeError> {
    self.listener().ok_or_else(|| self.unsupported(Capability::Listen))
  }

  pub fn require_connector(&self) -> Result<&dyn Connector, SchemeError> {
    self
      .connector()
      .ok_or_else(|| self.unsupported(Capability::Connect))
  }

  fn unsupported(&self, capability: Capability) -> SchemeError {
    SchemeError::Unsupported {
      scheme: self.names().first().copied().unwrap_or_default().to_string(),
      capability,
    }
  }
}
