//! OS tunnel backend abstraction.
//!
//! Each platform (and each protocol on that platform) supplies one
//! implementation. The state machine in `ConnectionApi` never talks to the
//! OS directly; it drives a `PlatformTunnel` and folds the backend's event
//! stream into its own transitions.

use crate::types::ConnectionInfo;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
  #[error("Failed to create tunnel entry: {0}")]
  CreateEntry(String),
  #[error("Tunnel connect failed: {0}")]
  Connect(String),
  #[error("Tunnel disconnect failed: {0}")]
  Disconnect(String),
  /// The OS refused the operation outright (missing permission, policy).
  /// Maps to `ConnectionState::ConnectNotAllowed` rather than a plain
  /// failure so the UI can distinguish "retry" from "fix your setup".
  #[error("Operation not permitted: {0}")]
  NotAllowed(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Tunnel lifecycle notifications originating from the OS, for platforms
/// whose VPN service reports progress asynchronously (or starts tunnels on
/// its own when on-demand is enabled). Fed into
/// `ConnectionApi::handle_tunnel_event`, where the same suppression rules
/// apply as for request-driven transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
  Created,
  CreateFailed(String),
  IsConnecting,
  Connected,
  ConnectFailed(String),
  IsDisconnecting,
  Disconnected,
}

/// A platform tunnel primitive.
///
/// Contract: `connect` and `disconnect` resolve once the OS has actually
/// brought the tunnel up or down. Backends that only learn the outcome via
/// OS callbacks should still resolve promptly and reconcile through
/// `TunnelEvent`s. Blocking OS calls must be offloaded (`spawn_blocking`),
/// never run inline on the async runtime.
#[async_trait]
pub trait PlatformTunnel: Send {
  /// Create or update the OS tunnel entry from negotiated credentials.
  async fn create_entry(&mut self, info: &ConnectionInfo) -> Result<(), PlatformError>;

  async fn connect(&mut self) -> Result<(), PlatformError>;

  async fn disconnect(&mut self) -> Result<(), PlatformError>;

  /// Probe the live OS state of the tunnel. Used to reconcile after
  /// network changes or missed events.
  async fn check_connection(&mut self) -> Result<bool, PlatformError>;

  /// Toggle OS-managed on-demand activation for the entry. Backends
  /// without on-demand support ignore this.
  fn set_on_demand(&mut self, _enabled: bool) {}

  /// Whether this platform keeps a failed state visible instead of letting
  /// a trailing OS "disconnected" notification overwrite it. The Windows
  /// RAS backend reports a disconnect right after a dial failure, which
  /// would wipe the error from the UI.
  fn suppress_disconnect_after_failure(&self) -> bool {
    false
  }
}
