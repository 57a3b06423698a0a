//! Observer events fanned out to the owning application layer.

use crate::types::ConnectionState;

/// Events broadcast to subscribers of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnEvent {
  ConnectionStateChanged(ConnectionState),
  /// Region catalog fetch finished; the flag reflects the catalog fetch
  /// only (a failed timezone lookup still yields a ready catalog).
  RegionDataReady(bool),
  SelectedRegionChanged(String),
}
