//! Scripted tunnel backend for tests and manual UI development.
//!
//! Behaves like an instant, always-cooperative OS tunnel by default; each
//! failure mode can be toggled through the shared handle, and every call is
//! recorded so tests can assert on what the state machine actually did.

use super::platform::{PlatformError, PlatformTunnel};
use crate::types::ConnectionInfo;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct SimState {
  fail_create: bool,
  fail_connect: bool,
  deny_connect: bool,
  fail_disconnect: bool,
  suppress_disconnect_after_failure: bool,
  connected: bool,
  created_with: Option<ConnectionInfo>,
  create_calls: usize,
  connect_calls: usize,
  disconnect_calls: usize,
  check_calls: usize,
  on_demand: Option<bool>,
}

/// Inspection/scripting handle shared with the tunnel instance.
#[derive(Debug, Clone, Default)]
pub struct SimTunnelHandle {
  state: Arc<Mutex<SimState>>,
}

impl SimTunnelHandle {
  fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn set_fail_create(&self, fail: bool) {
    self.lock().fail_create = fail;
  }

  pub fn set_fail_connect(&self, fail: bool) {
    self.lock().fail_connect = fail;
  }

  /// Make the next connect fail as "not allowed" rather than a plain error.
  pub fn set_deny_connect(&self, deny: bool) {
    self.lock().deny_connect = deny;
  }

  pub fn set_fail_disconnect(&self, fail: bool) {
    self.lock().fail_disconnect = fail;
  }

  pub fn set_suppress_disconnect_after_failure(&self, suppress: bool) {
    self.lock().suppress_disconnect_after_failure = suppress;
  }

  /// Force the simulated OS tunnel state, as if it changed behind our back.
  pub fn set_connected(&self, connected: bool) {
    self.lock().connected = connected;
  }

  pub fn is_connected(&self) -> bool {
    self.lock().connected
  }

  pub fn created_with(&self) -> Option<ConnectionInfo> {
    self.lock().created_with.clone()
  }

  pub fn create_calls(&self) -> usize {
    self.lock().create_calls
  }

  pub fn connect_calls(&self) -> usize {
    self.lock().connect_calls
  }

  pub fn disconnect_calls(&self) -> usize {
    self.lock().disconnect_calls
  }

  pub fn check_calls(&self) -> usize {
    self.lock().check_calls
  }

  pub fn on_demand(&self) -> Option<bool> {
    self.lock().on_demand
  }
}

/// The tunnel half. Owned by `ConnectionApi`; the paired handle stays with
/// the test.
#[derive(Debug)]
pub struct SimTunnel {
  handle: SimTunnelHandle,
}

impl SimTunnel {
  pub fn new() -> (Self, SimTunnelHandle) {
    let handle = SimTunnelHandle::default();
    (
      Self {
        handle: handle.clone(),
      },
      handle,
    )
  }
}

#[async_trait]
impl PlatformTunnel for SimTunnel {
  async fn create_entry(&mut self, info: &ConnectionInfo) -> Result<(), PlatformError> {
    let mut state = self.handle.lock();
    state.create_calls += 1;
    if state.fail_create {
      return Err(PlatformError::CreateEntry("simulated failure".to_string()));
    }
    state.created_with = Some(info.clone());
    Ok(())
  }

  async fn connect(&mut self) -> Result<(), PlatformError> {
    let mut state = self.handle.lock();
    state.connect_calls += 1;
    if state.deny_connect {
      return Err(PlatformError::NotAllowed("simulated denial".to_string()));
    }
    if state.fail_connect {
      return Err(PlatformError::Connect("simulated failure".to_string()));
    }
    state.connected = true;
    Ok(())
  }

  async fn disconnect(&mut self) -> Result<(), PlatformError> {
    let mut state = self.handle.lock();
    state.disconnect_calls += 1;
    if state.fail_disconnect {
      return Err(PlatformError::Disconnect("simulated failure".to_string()));
    }
    state.connected = false;
    Ok(())
  }

  async fn check_connection(&mut self) -> Result<bool, PlatformError> {
    let mut state = self.handle.lock();
    state.check_calls += 1;
    Ok(state.connected)
  }

  fn set_on_demand(&mut self, enabled: bool) {
    self.handle.lock().on_demand = Some(enabled);
  }

  fn suppress_disconnect_after_failure(&self) -> bool {
    self.handle.lock().suppress_disconnect_after_failure
  }
}
