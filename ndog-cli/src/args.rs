// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use clap::{ArgMatches, Values};
use ndog::scheme::{Endpoint, NetConfig, Options, OptionsError, SchemeError, TlsConfig};

#[derive(thiserror::Error, Debug)]
pub enum ArgumentError {
  #[error("one of --listen or --connect is required")]
  NoEndpoint,
  #[error("--{0} and --{1} cannot be used together")]
  Conflict(&'static str, &'static str),
  #[error("--{0} cannot be used when proxying between --listen and --connect")]
  NotWhenProxying(&'static str),
  #[error("--tee requires --exec")]
  TeeWithoutExec,
  #[error("--connect-option requires both --listen and --connect")]
  ConnectOptionWithoutProxy,
  #[error("unterminated {0} quote in command")]
  UnbalancedQuote(char),
  #[error("command ends with a bare backslash")]
  TrailingEscape,
  #[error("command is empty")]
  EmptyCommand,
  #[error(transparent)]
  Options(#[from] OptionsError),
  #[error(transparent)]
  Scheme(#[from] SchemeError),
}

/// What each local stream is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
  /// Live standard input and output
  Stdio,
  /// Fixed data, replayed to every stream
  Data(String),
  /// A subprocess per stream
  Exec { argv: Vec<String>, tee: bool },
}

/// Parameters for a listen, connect, or proxy run
#[derive(Debug, Clone)]
pub struct RunArgs {
  pub listen: Option<Endpoint>,
  pub connect: Option<Endpoint>,
  /// Options for the listen endpoint if there is one, otherwise the connect endpoint
  pub options: Options,
  /// Options for the connect endpoint when proxying
  pub connect_options: Options,
  pub input: Input,
  pub log_io: bool,
  pub net: NetConfig,
  pub tls: TlsConfig,
}

/// Splits a command line into words
///
/// Whitespace separates words. Single quotes preserve their content
/// literally; double quotes do too, apart from `\"` and `\\`. Outside quotes
/// a backslash escapes the next character.
pub fn split_command(command: &str) -> Result<Vec<String>, ArgumentError> {
  let mut words = Vec::new();
  let mut word = String::new();
  let mut in_word = false;
  let mut chars = command.chars();
  while let Some(c) = chars.next() {
    match c {
      '\'' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('\'') => break,
            Some(c) => word.push(c),
            None => return Err(ArgumentError::UnbalancedQuote('\'')),
          }
        }
      }
      '"' => {
        in_word = true;
        loop {
          match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
              Some(c @ ('"' | '\\')) => word.push(c),
              Some(c) => {
                word.push('\\');
                word.push(c);
              }
              None => return Err(ArgumentError::UnbalancedQuote('"')),
            },
            Some(c) => word.push(c),
            None => return Err(ArgumentError::UnbalancedQuote('"')),
          }
        }
      }
      '\\' => match chars.next() {
        Some(c) => {
          in_word = true;
          word.push(c);
        }
        None => return Err(ArgumentError::TrailingEscape),
      },
      c if c.is_whitespace() => {
        if in_word {
          words.push(std::mem::take(&mut word));
          in_word = false;
        }
      }
      c => {
        in_word = true;
        word.push(c);
      }
    }
  }
  if in_word {
    words.push(word);
  }
  if words.is_empty() {
    return Err(ArgumentError::EmptyCommand);
  }
  Ok(words)
}

pub fn validate_option_pair(pair: &str) -> Result<(), OptionsError> {
  Options::parse_pair(pair).map(|_| ())
}

fn parse_options(values: Option<Values<'_>>) -> Result<Options, ArgumentError> {
  values
    .into_iter()
    .flatten()
    .map(|pair| Options::parse_pair(pair).map_err(ArgumentError::from))
    .collect()
}

fn parse_endpoint(args: &ArgMatches, name: &str) -> Result<Option<Endpoint>, ArgumentError> {
  Ok(args.value_of(name).map(Endpoint::parse).transpose()?)
}

pub fn run_arg_handling(args: &'_ ArgMatches) -> Result<RunArgs, ArgumentError> {
  let listen = parse_endpoint(args, "listen")?;
  let connect = parse_endpoint(args, "connect")?;
  if listen.is_none() && connect.is_none() {
    return Err(ArgumentError::NoEndpoint);
  }
  let proxying = listen.is_some() && connect.is_some();

  let exec = args.value_of("exec");
  let data = args.value_of("data");
  let tee = args.is_present("tee");
  let input = match (exec, data) {
    (Some(_), Some(_)) => return Err(ArgumentError::Conflict("exec", "data")),
    (Some(_), None) if proxying => return Err(ArgumentError::NotWhenProxying("exec")),
    (None, Some(_)) if proxying => return Err(ArgumentError::NotWhenProxying("data")),
    (Some(command), None) => Input::Exec {
      argv: split_command(command)?,
      tee,
    },
    (None, Some(data)) => Input::Data(data.to_string()),
    (None, None) => Input::Stdio,
  };
  if tee && !matches!(input, Input::Exec { .. }) {
    return Err(ArgumentError::TeeWithoutExec);
  }

  let connect_options = parse_options(args.values_of("connect-option"))?;
  if !connect_options.is_empty() && !proxying {
    return Err(ArgumentError::ConnectOptionWithoutProxy);
  }

  Ok(RunArgs {
    listen,
    connect,
    options: parse_options(args.values_of("option"))?,
    connect_options,
    input,
    log_io: args.is_present("log-io"),
    net: NetConfig {
      reuse_port: args.is_present("reuseport"),
    },
    tls: TlsConfig {
      skip_verify: args.is_present("tls-skip-verify"),
      server_name: args.value_of("tls-server-name").map(String::from),
      ca_cert: args.value_of("tls-ca-cert").map(Into::into),
      cert: args.value_of("tls-cert").map(Into::into),
      key: args.value_of("tls-key").map(Into::into),
    },
  })
}

#[cfg(test)]
mod tests {
  use super::{split_command, ArgumentError};

  fn words(command: &str) -> Vec<String> {
    split_command(command).unwrap()
  }

  #[test]
  fn whitespace_separates_words() {
    assert_eq!(words("  cat   -u\t-n "), vec!["cat", "-u", "-n"]);
  }

  #[test]
  fn quotes_group_words() {
    assert_eq!(
      words(r#"sh -c 'echo "$1" | tr a b' "two words""#),
      vec!["sh", "-c", r#"echo "$1" | tr a b"#, "two words"]
    );
    assert_eq!(words(r#"printf "a\"b\\c\n""#), vec!["printf", r#"a"b\c\n"#]);
    assert_eq!(words("''"), vec![""]);
  }

  #[test]
  fn backslash_escapes_outside_quotes() {
    assert_eq!(words(r"echo a\ b \'"), vec!["echo", "a b", "'"]);
  }

  #[test]
  fn malformed_commands_are_rejected() {
    assert!(matches!(
      split_command("echo 'oops"),
      Err(ArgumentError::UnbalancedQuote('\''))
    ));
    assert!(matches!(
      split_command("echo \"oops"),
      Err(ArgumentError::UnbalancedQuote('"'))
    ));
    assert!(matches!(
      split_command("echo \\"),
      Err(ArgumentError::TrailingEscape)
    ));
    assert!(matches!(
      split_command("   "),
      Err(ArgumentError::EmptyCommand)
    ));
  }
}
