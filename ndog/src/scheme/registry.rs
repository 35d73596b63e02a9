// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  collections::{BTreeMap, HashMap},
  sync::Arc,
};

use super::{tcp::TcpScheme, tls::TlsScheme, udp::UdpScheme, Endpoint, Scheme, SchemeError};

/// Lookup table from scheme name to handler
///
/// Every visible and hidden name must be unique across all registered schemes.
#[derive(Default)]
pub struct SchemeRegistry {
  by_name: HashMap<&'static str, Arc<dyn Scheme>>,
  visible: BTreeMap<&'static str, Arc<dyn Scheme>>,
}

impl SchemeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry holding every scheme shipped with this crate
  pub fn builtin() -> Result<Self, SchemeError> {
    let mut registry = Self::new();
    registry.register(Arc::new(TcpScheme))?;
    registry.register(Arc::new(TlsScheme))?;
    registry.register(Arc::new(UdpScheme))?;
    Ok(registry)
  }

  /// Adds `scheme` under all of its names; nothing is added on conflict
  pub fn register(&mut self, scheme: Arc<dyn Scheme>) -> Result<(), SchemeError> {
    let names = scheme
      .names()
      .iter()
      .chain(scheme.hidden_names())
      .copied()
      .collect::<Vec<&'static str>>();
    for (index, name) in names.iter().enumerate() {
      if self.by_name.contains_key(name) || names[..index].contains(name) {
        return Err(SchemeError::Conflict(*name));
      }
    }
    for name in names {
      self.by_name.insert(name, Arc::clone(&scheme));
    }
    for name in scheme.names() {
      self.visible.insert(*name, Arc::clone(&scheme));
    }
    tracing::trace!(names = ?scheme.names(), "registered scheme");
    Ok(())
  }

  pub fn lookup(&self, name: &str) -> Option<Arc<dyn Scheme>> {
    self.by_name.get(name).cloned()
  }

  /// Finds the handler for the base scheme of `endpoint`
  pub fn resolve(&self, endpoint: &Endpoint) -> Result<Arc<dyn Scheme>, SchemeError> {
    self
      .lookup(endpoint.scheme())
      .ok_or_else(|| SchemeError::Unknown(endpoint.scheme().to_string()))
  }

  /// Listed names in sorted order, excluding hidden aliases
  pub fn visible(&self) -> impl Iterator<Item = (&'static str, &Arc<dyn Scheme>)> {
    self.visible.iter().map(|(name, scheme)| (*name, scheme))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::SchemeRegistry;
  use crate::scheme::{Capability, Endpoint, Scheme, SchemeError};

  struct Named(&'static [&'static str], &'static [&'static str]);

  impl Scheme for Named {
    fn names(&self) -> &'static [&'static str] {
      self.0
    }

    fn hidden_names(&self) -> &'static [&'static str] {
      self.1
    }

    fn description(&self) -> &'static str {
      "test scheme"
    }
  }

  #[test]
  fn hidden_names_resolve_but_are_not_listed() {
    let mut registry = SchemeRegistry::new();
    registry
      .register(Arc::new(Named(&["ws", "websocket"], &["wss-legacy"])))
      .unwrap();
    assert!(registry.lookup("wss-legacy").is_some());
    assert!(registry.lookup("websocket").is_some());
    let listed = registry.visible().map(|(name, _)| name).collect::<Vec<_>>();
    assert_eq!(listed, vec!["websocket", "ws"]);
  }

  #[test]
  fn conflicting_names_are_rejected_atomically() {
    let mut registry = SchemeRegistry::new();
    registry.register(Arc::new(Named(&["a"], &[]))).unwrap();
    let err = registry
      .register(Arc::new(Named(&["b", "a"], &[])))
      .unwrap_err();
    assert!(matches!(err, SchemeError::Conflict("a")));
    assert!(registry.lookup("b").is_none());
  }

  #[test]
  fn builtin_schemes_advertise_capabilities() {
    let registry = SchemeRegistry::builtin().unwrap();
    let listed = registry.visible().map(|(name, _)| name).collect::<Vec<_>>();
    assert_eq!(listed, vec!["tcp", "tls", "udp"]);
    for (_, scheme) in registry.visible() {
      assert_eq!(
        scheme.capabilities(),
        vec![Capability::Listen, Capability::Connect]
      );
    }
  }

  #[test]
  fn unknown_scheme_is_a_configuration_error() {
    let registry = SchemeRegistry::builtin().unwrap();
    let endpoint = Endpoint::parse("gopher://localhost:70").unwrap();
    assert!(matches!(
      registry.resolve(&endpoint),
      Err(SchemeError::Unknown(name)) if name == "gopher"
    ));
  }

  #[test]
  fn missing_capability_is_reported() {
    let scheme: Arc<dyn Scheme> = Arc::new(Named(&["inert"], &[]));
    assert!(matches!(
      scheme.require_listener(),
      Err(SchemeError::Unsupported {
        capability: Capability::Listen,
        ..
      })
    ));
  }
}
