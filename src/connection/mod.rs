//! Connection subsystem: protocol strategies, platform tunnel backends,
//! and the state machine that ties them together.

pub mod api;
pub mod ikev2;
pub mod manager;
pub mod platform;
#[cfg(windows)]
pub mod ras;
pub mod sim;
pub mod wg_quick;
pub mod wireguard;

use crate::api_client::VpnApiClient;
use crate::credentials::CredentialError;
use crate::storage::VpnStorage;
use crate::types::{ConnectionInfo, Hostname, ProtocolKind};
use async_trait::async_trait;

pub use api::ConnectionApi;
pub use manager::{ConnectionManager, ManagerConfig};
pub use platform::{PlatformError, PlatformTunnel, TunnelEvent};

/// Protocol-specific credential negotiation.
///
/// A strategy turns a picked server host plus a subscriber credential into
/// ready-to-dial connection material. It owns the protocol's credential
/// caching policy, but never touches the OS; that is the tunnel backend's
/// job.
#[async_trait]
pub trait ProtocolStrategy: Send + Sync {
  fn kind(&self) -> ProtocolKind;

  async fn negotiate(
    &self,
    client: &VpnApiClient,
    storage: &VpnStorage,
    host: &Hostname,
    subscriber_credential: &str,
  ) -> Result<ConnectionInfo, CredentialError>;

  /// Invoked on every transition into a failed state, before the state is
  /// committed. Strategies drop whatever cached material could be at
  /// fault.
  fn on_connect_failed(&self, storage: &VpnStorage);
}

/// Build the strategy for a protocol selection.
pub fn strategy_for(kind: ProtocolKind, entry_name: &str) -> Box<dyn ProtocolStrategy> {
  match kind {
    ProtocolKind::Ikev2 => Box::new(ikev2::Ikev2Strategy::new(entry_name)),
    ProtocolKind::WireGuard => Box::new(wireguard::WireGuardStrategy),
  }
}
