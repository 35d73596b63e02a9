// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use std::{io::IsTerminal, time::Duration};

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use ndog::scheme::SchemeRegistry;

mod args;
mod run;

use args::{run_arg_handling, validate_option_pair};

fn init_tracing(verbosity: u64) {
  let default_level = match verbosity {
    0 => "info",
    1 => "debug",
    _ => "trace",
  };
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .with_ansi(std::io::stderr().is_terminal())
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
}

fn build_cli() -> Command<'static> {
  Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("listen")
        .help("Listen on URL, creating a stream per peer")
        .long("listen")
        .short('l')
        .value_name("URL")
        .takes_value(true),
    )
    .arg(
      Arg::new("connect")
        .help("Connect to URL; with --listen, proxy each peer to it")
        .long("connect")
        .short('c')
        .value_name("URL")
        .takes_value(true),
    )
    .arg(
      Arg::new("option")
        .help("Scheme option for the listen URL, or the connect URL when not listening")
        .long("option")
        .short('o')
        .value_name("KEY[=VALUE]")
        .validator(validate_option_pair)
        .takes_value(true)
        .number_of_values(1)
        .multiple_occurrences(true),
    )
    .arg(
      Arg::new("connect-option")
        .help("Scheme option for the connect URL when proxying")
        .long("connect-option")
        .short('O')
        .value_name("KEY[=VALUE]")
        .validator(validate_option_pair)
        .takes_value(true)
        .number_of_values(1)
        .multiple_occurrences(true),
    )
    .arg(
      Arg::new("exec")
        .help("Run CMD for each stream, relaying its stdin and stdout")
        .long("exec")
        .short('x')
        .value_name("CMD")
        .takes_value(true),
    )
    .arg(
      Arg::new("data")
        .help("Send DATA to each stream instead of reading stdin")
        .long("data")
        .short('d')
        .value_name("DATA")
        .takes_value(true),
    )
    .arg(
      Arg::new("tee")
        .help("Also write subprocess input to stdout")
        .long("tee"),
    )
    .arg(
      Arg::new("log-io")
        .help("Log all traffic to stderr")
        .long("log-io"),
    )
    .arg(
      Arg::new("verbose")
        .help("Increase log verbosity; repeat for more")
        .short('v')
        .long("verbose")
        .multiple_occurrences(true),
    )
    .arg(
      Arg::new("list-schemes")
        .help("List available schemes")
        .long("list-schemes"),
    )
    .arg(
      Arg::new("scheme-help")
        .help("Describe a scheme and its options")
        .long("scheme-help")
        .value_name("NAME")
        .takes_value(true),
    )
    .arg(
      Arg::new("reuseport")
        .help("Bind listeners with SO_REUSEPORT")
        .long("reuseport"),
    )
    .arg(
      Arg::new("tls-skip-verify")
        .help("Do not verify TLS server certificates")
        .long("tls-skip-verify")
        .env("NDOG_TLS_SKIP_VERIFY"),
    )
    .arg(
      Arg::new("tls-server-name")
        .help("Name to verify the TLS server against, instead of the URL host")
        .long("tls-server-name")
        .value_name("NAME")
        .env("NDOG_TLS_SERVER_NAME")
        .takes_value(true),
    )
    .arg(
      Arg::new("tls-ca-cert")
        .help("PEM CA certificates to trust, besides the system roots, when connecting")
        .long("tls-ca-cert")
        .value_name("PATH")
        .env("NDOG_TLS_CA_CERT")
        .takes_value(true),
    )
    .arg(
      Arg::new("tls-cert")
        .help("PEM certificate chain for TLS listeners")
        .long("tls-cert")
        .value_name("PATH")
        .env("NDOG_TLS_CERT")
        .requires("tls-key")
        .takes_value(true),
    )
    .arg(
      Arg::new("tls-key")
        .help("PEM private key for TLS listeners")
        .long("tls-key")
        .value_name("PATH")
        .env("NDOG_TLS_KEY")
        .requires("tls-cert")
        .takes_value(true),
    )
    .arg_required_else_help(true)
}

fn main() {
  let matches = build_cli().get_matches();
  init_tracing(matches.occurrences_of("verbose"));
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("ndog-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  let result = rt.block_on(main_args_handler(&matches));
  // Stdin is read on a blocking thread which may never return
  rt.shutdown_timeout(Duration::from_millis(100));
  if let Err(err) = result {
    tracing::error!(err = ?err, "ndog failed");
    std::process::exit(1);
  }
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  let registry = SchemeRegistry::builtin()?;
  if matches.is_present("list-schemes") {
    print!("{}", run::list_schemes(&registry));
    return Ok(());
  }
  if let Some(name) = matches.value_of("scheme-help") {
    print!("{}", run::scheme_help(&registry, name)?);
    return Ok(());
  }
  let config = run_arg_handling(matches)?;
  tracing::debug!("Running with config {:?}", config);
  run::run_main(config, &registry).await
}
