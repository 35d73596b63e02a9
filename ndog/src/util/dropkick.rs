// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

/// "Dropkicking" a value tells it to perform its close notification when dropped.
pub trait DropkickSync {
  fn dropkick(self);
}

impl<F, R> DropkickSync for F
where
  F: FnOnce() -> R,
{
  fn dropkick(self) {
    let _ = (self)();
  }
}

/// A notification fired exactly once, when either [Dropkick::kick]ed or dropped
#[derive(Debug)]
#[repr(transparent)]
pub struct Dropkick<T: DropkickSync> {
  inner: Option<T>,
}

impl<T> Dropkick<T>
where
  T: DropkickSync,
{
  pub fn new(target: T) -> Self {
    Self {
      inner: Some(target),
    }
  }

  /// Fires the notification immediately; later kicks and the eventual drop do nothing
  pub fn kick(&mut self) {
    if let Some(target) = self.inner.take() {
      target.dropkick();
    }
  }
}

impl<T> Drop for Dropkick<T>
where
  T: DropkickSync,
{
  fn drop(&mut self) {
    self.kick();
  }
}

/// Boxed close notification, as carried by stream halves
pub type CloseHook = Dropkick<Box<dyn FnOnce() + Send + 'static>>;

pub fn close_hook(f: impl FnOnce() + Send + 'static) -> CloseHook {
  Dropkick::new(Box::new(f))
}
