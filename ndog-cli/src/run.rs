// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use anyhow::Result;
use ndog::{
  manager::{
    exec::ExecStreamManager, log::LogStreamManager, proxy::ProxyStreamManager,
    stdio::StdIoStreamManager, stdout_output, StreamManager,
  },
  scheme::{Config, ConnectConfig, Endpoint, ListenConfig, Options, SchemeRegistry},
  util::cancellation::{cancel_on_interrupt, ShutdownListener},
};
use tokio_util::sync::CancellationToken;

use crate::args::{ArgumentError, Input, RunArgs};

fn local_streams(input: Input) -> Result<Box<dyn StreamManager>> {
  Ok(match input {
    Input::Stdio => Box::new(StdIoStreamManager::from_stdin()),
    Input::Data(data) => Box::new(StdIoStreamManager::with_data(data)),
    Input::Exec { argv, tee } => {
      let manager = ExecStreamManager::new(argv)?;
      Box::new(match tee {
        true => manager.with_tee(stdout_output()),
        false => manager,
      })
    }
  })
}

fn with_logging(streams: impl StreamManager + 'static, log_io: bool) -> Arc<dyn StreamManager> {
  match log_io {
    true => Arc::new(LogStreamManager::new(streams)),
    false => Arc::new(streams),
  }
}

pub async fn run_main(args: RunArgs, registry: &SchemeRegistry) -> Result<()> {
  let shutdown = CancellationToken::new();
  let interrupt = cancel_on_interrupt(shutdown.clone());
  let result = dispatch(args, registry, shutdown.into()).await;
  interrupt.abort();
  result
}

async fn dispatch(
  args: RunArgs,
  registry: &SchemeRegistry,
  shutdown: ShutdownListener,
) -> Result<()> {
  let RunArgs {
    listen,
    connect,
    options,
    connect_options,
    input,
    log_io,
    net,
    tls,
  } = args;
  let config_for = |endpoint: Endpoint, options: Options| Config {
    endpoint,
    options,
    net: net.clone(),
    tls: tls.clone(),
  };

  match (listen, connect) {
    (Some(listen), Some(connect)) => {
      // Both capabilities are checked before anything starts
      let listen_scheme = registry.resolve(&listen)?;
      let listener = listen_scheme.require_listener()?;
      let connect_scheme = registry.resolve(&connect)?;
      connect_scheme.require_connector()?;
      tracing::info!(%listen, %connect, "proxying");
      let proxy = ProxyStreamManager::new(connect_scheme, config_for(connect, connect_options))?;
      listener
        .listen(ListenConfig {
          config: config_for(listen, options),
          streams: with_logging(proxy, log_io),
          shutdown,
        })
        .await
    }
    (Some(listen), None) => {
      let scheme = registry.resolve(&listen)?;
      let listener = scheme.require_listener()?;
      listener
        .listen(ListenConfig {
          config: config_for(listen, options),
          streams: with_logging(local_streams(input)?, log_io),
          shutdown,
        })
        .await
    }
    (None, Some(connect)) => {
      let scheme = registry.resolve(&connect)?;
      let connector = scheme.require_connector()?;
      let streams = with_logging(local_streams(input)?, log_io);
      let stream = streams.new_stream(connect.url().as_str())?;
      connector
        .connect(ConnectConfig {
          config: config_for(connect, options),
          stream,
        })
        .await
    }
    (None, None) => Err(ArgumentError::NoEndpoint.into()),
  }
}

/// Visible schemes and their capabilities, one per line
pub fn list_schemes(registry: &SchemeRegistry) -> String {
  let width = registry
    .visible()
    .map(|(name, _)| name.len())
    .max()
    .unwrap_or(0);
  registry
    .visible()
    .map(|(name, scheme)| {
      let capabilities = scheme
        .capabilities()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
      format!("{:width$}  ({})\n", name, capabilities, width = width)
    })
    .collect()
}

pub fn scheme_help(registry: &SchemeRegistry, name: &str) -> Result<String> {
  let scheme = registry
    .lookup(name)
    .ok_or_else(|| ndog::scheme::SchemeError::Unknown(name.to_string()))?;
  let mut help = format!("{}\n", scheme.description().trim());
  for (heading, options) in [
    ("Listen options", scheme.listen_options()),
    ("Connect options", scheme.connect_options()),
  ] {
    if !options.is_empty() {
      help.push_str(&format!("\n{}:\n{}", heading, options));
    }
  }
  Ok(help)
}
