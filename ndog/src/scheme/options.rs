// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{collections::BTreeMap, fmt::Display, str::FromStr};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
  #[error("unknown options: {}", .0.join(", "))]
  Unknown(Vec<String>),
  #[error("invalid value {value:?} for option `{key}`: {reason}")]
  Invalid {
    key: String,
    value: String,
    reason: String,
  },
  #[error("option has an empty key: {0:?}")]
  EmptyKey(String),
}

/// Per-handler settings, supplied as `key[=value]` pairs
///
/// Handlers pop each key they understand and then call [Options::done], so
/// that every supplied option is consumed by exactly one handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
  entries: BTreeMap<String, String>,
}

impl Options {
  pub fn new() -> Self {
    Self::default()
  }

  /// Parses `key=value`; a bare `key` has an empty value
  pub fn parse_pair(pair: &str) -> Result<(String, String), OptionsError> {
    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
    if key.is_empty() {
      return Err(OptionsError::EmptyKey(pair.to_string()));
    }
    Ok((key.to_string(), value.to_string()))
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
    self.entries.insert(key.into(), value.into())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn pop(&mut self, key: &str) -> Option<String> {
    self.entries.remove(key)
  }

  /// Pops a key whose presence alone is meaningful
  pub fn pop_flag(&mut self, key: &str) -> bool {
    self.pop(key).is_some()
  }

  pub fn pop_parsed<T>(&mut self, key: &str) -> Result<Option<T>, OptionsError>
  where
    T: FromStr,
    T::Err: Display,
  {
    match self.pop(key) {
      None => Ok(None),
      Some(value) => value
        .parse()
        .map(Some)
        .map_err(|e: T::Err| OptionsError::Invalid {
          key: key.to_string(),
          reason: e.to_string(),
          value,
        }),
    }
  }

  /// Fails, naming every key, if any option remains unconsumed
  pub fn done(self) -> Result<(), OptionsError> {
    if self.entries.is_empty() {
      Ok(())
    } else {
      Err(OptionsError::Unknown(self.entries.into_keys().collect()))
    }
  }
}

impl FromIterator<(String, String)> for Options {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    Self {
      entries: iter.into_iter().collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionHelp {
  pub name: &'static str,
  pub value: &'static str,
  pub description: &'static str,
}

/// Documentation for the options a handler accepts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionsHelp {
  entries: Vec<OptionHelp>,
}

impl OptionsHelp {
  pub fn new() -> Self {
    Self::default()
  }

  /// `value` describes the expected value, and is empty for flags
  pub fn add(mut self, name: &'static str, value: &'static str, description: &'static str) -> Self {
    self.entries.push(OptionHelp {
      name,
      value,
      description,
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

impl Display for OptionsHelp {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let usages = self
      .entries
      .iter()
      .map(|entry| match entry.value {
        "" => entry.name.to_string(),
        value => format!("{}={}", entry.name, value),
      })
      .collect::<Vec<_>>();
    let width = usages.iter().map(String::len).max().unwrap_or(0);
    for (usage, entry) in usages.iter().zip(&self.entries) {
      writeln!(f, "  {:width$}  {}", usage, entry.description, width = width)?;
    }
    Ok(())
  }
}
