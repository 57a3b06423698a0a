//! Consumer VPN connection-lifecycle core.
//!
//! Owns everything between "the user pressed Connect" and an established
//! tunnel: region catalog management, server selection, subscriber and
//! protocol credential negotiation, and the connection state machine that
//! folds request-driven and OS-driven transitions into one event stream.
//!
//! The embedding application supplies a [`connection::PlatformTunnel`]
//! backend and drives a [`connection::ConnectionManager`].

pub mod api_client;
pub mod connection;
pub mod credentials;
pub mod events;
pub mod hostname;
pub mod region_data;
pub mod storage;
pub mod types;

pub use api_client::{ApiError, PurchaseProof, VpnApiClient};
pub use connection::{
  ConnectionApi, ConnectionManager, ManagerConfig, PlatformError, PlatformTunnel, TunnelEvent,
};
pub use events::VpnEvent;
pub use region_data::RegionDataManager;
pub use storage::VpnStorage;
pub use types::{ConnectionInfo, ConnectionState, ProtocolKind, Region};
