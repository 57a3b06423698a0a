//! Top-level orchestrator owning the region data, the active connection
//! instance, and the credential refresh task.
//!
//! The manager is the only public entry point the embedding application
//! needs: it wires storage, API client, and event fan-out together, resolves
//! the target region before every connect, and rebuilds the connection
//! instance when the protocol selection changes.

use super::api::ConnectionApi;
use super::platform::{PlatformTunnel, TunnelEvent};
use super::strategy_for;
use crate::api_client::{ApiError, PurchaseProof, VpnApiClient};
use crate::credentials::spawn_refresh_task;
use crate::events::VpnEvent;
use crate::region_data::RegionDataManager;
use crate::storage::VpnStorage;
use crate::types::{ConnectionState, ProtocolKind, Region};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
  pub api_base_url: String,
  pub purchase_proof: PurchaseProof,
  pub protocol: ProtocolKind,
  /// Display name for the OS tunnel entry.
  pub entry_name: String,
  /// Storage directory override; `None` uses the platform data dir.
  pub storage_dir: Option<std::path::PathBuf>,
}

pub struct ConnectionManager {
  config: ManagerConfig,
  api_client: VpnApiClient,
  storage: VpnStorage,
  region_data: RegionDataManager,
  connection: ConnectionApi,
  events: broadcast::Sender<VpnEvent>,
  refresh_task: Option<tokio::task::JoinHandle<()>>,
}

impl ConnectionManager {
  pub fn new(config: ManagerConfig, tunnel: Box<dyn PlatformTunnel>) -> Self {
    let storage = match &config.storage_dir {
      Some(dir) => VpnStorage::with_dir(dir),
      None => VpnStorage::new(),
    };
    let api_client = VpnApiClient::new(&config.api_base_url);
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let region_data =
      RegionDataManager::new(api_client.clone(), storage.clone(), events.clone());
    let connection = ConnectionApi::new(
      strategy_for(config.protocol, &config.entry_name),
      tunnel,
      api_client.clone(),
      storage.clone(),
      config.purchase_proof.clone(),
      events.clone(),
    );

    Self {
      config,
      api_client,
      storage,
      region_data,
      connection,
      events,
      refresh_task: None,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
    self.events.subscribe()
  }

  pub fn connection_state(&self) -> ConnectionState {
    self.connection.state()
  }

  pub fn is_connected(&self) -> bool {
    self.connection.state().is_connected()
  }

  pub fn last_error(&self) -> Option<&str> {
    self.connection.last_error()
  }

  pub fn regions(&self) -> &[Region] {
    self.region_data.regions()
  }

  pub fn selected_region(&self) -> Option<String> {
    if !self.region_data.is_ready() {
      return None;
    }
    self.region_data.selected_region().ok()
  }

  /// Connect to the currently selected region, fetching region data first
  /// when the cache is stale or absent.
  pub async fn connect(&mut self) {
    self.region_data.fetch_if_needed().await;
    if !self.region_data.is_ready() {
      self
        .connection
        .fail_precondition("Region data unavailable, cannot start connection");
      return;
    }

    let region = match self.region_data.selected_region() {
      Ok(region) => region,
      Err(e) => {
        self.connection.fail_precondition(&e.to_string());
        return;
      }
    };
    self.connection.connect(&region).await;
  }

  pub async fn disconnect(&mut self) {
    self.connection.disconnect().await;
  }

  /// Change the target region. Negotiated connection material is bound to
  /// the old region and dropped; an active tunnel stays up until the next
  /// connect.
  pub fn set_selected_region(&mut self, name: &str) {
    self.region_data.set_selected_region(name);
    self.connection.reset_connection_info();
  }

  /// Switch protocols, rebuilding the connection instance with the
  /// matching strategy. The caller supplies the tunnel backend since it is
  /// protocol- and platform-specific.
  pub async fn set_protocol(&mut self, protocol: ProtocolKind, tunnel: Box<dyn PlatformTunnel>) {
    if self.connection.state().is_connected() || self.connection.state().is_in_progress() {
      self.connection.disconnect().await;
    }
    log::info!("[vpn] Switching protocol to {protocol}");
    self.config.protocol = protocol;
    self.connection = ConnectionApi::new(
      strategy_for(protocol, &self.config.entry_name),
      tunnel,
      self.api_client.clone(),
      self.storage.clone(),
      self.config.purchase_proof.clone(),
      self.events.clone(),
    );
  }

  pub async fn handle_tunnel_event(&mut self, event: TunnelEvent) {
    self.connection.handle_tunnel_event(event).await;
  }

  pub async fn handle_network_change(&mut self) {
    self.connection.handle_network_change().await;
  }

  pub fn set_on_demand_enabled(&mut self, enabled: bool) {
    if let Err(e) = self.storage.set_on_demand_enabled(enabled) {
      log::warn!("[vpn] Failed to persist on-demand flag: {e}");
    }
    self.connection.set_on_demand(enabled);
  }

  pub fn on_demand_enabled(&self) -> bool {
    self.storage.on_demand_enabled()
  }

  /// Ask the backend whether the configured purchase is still active.
  pub async fn verify_purchase_token(&self) -> Result<String, ApiError> {
    let proof = &self.config.purchase_proof;
    self
      .api_client
      .verify_purchase_token(&proof.purchase_token, &proof.product_id, &proof.product_type)
      .await
  }

  pub async fn create_support_ticket(
    &self,
    email: &str,
    subject: &str,
    body: &str,
  ) -> Result<String, ApiError> {
    self.api_client.create_support_ticket(email, subject, body).await
  }

  /// Keep the subscriber credential fresh in the background. Replaces any
  /// previously started refresh task.
  pub fn start_credential_refresh(&mut self) {
    if let Some(task) = self.refresh_task.take() {
      task.abort();
    }
    self.refresh_task = Some(spawn_refresh_task(
      self.api_client.clone(),
      self.storage.clone(),
      self.config.purchase_proof.clone(),
    ));
  }

  /// Sign-out: tear down the tunnel and wipe every piece of credential
  /// material, telling the backend to invalidate WireGuard device
  /// credentials best effort.
  pub async fn reset(&mut self) {
    self.connection.disconnect().await;

    if let (Some(profile), Some(credential)) = (
      self.storage.wireguard_profile(),
      self.storage.subscriber_credential(),
    ) {
      // Invalidate against the host the device was registered with.
      // Profiles cached before the hostname was recorded fall back to the
      // tunnel endpoint's host part.
      let host = if profile.hostname.is_empty() {
        profile
          .endpoint
          .split(':')
          .next()
          .unwrap_or(&profile.endpoint)
          .to_string()
      } else {
        profile.hostname.clone()
      };
      if let Err(e) = self
        .api_client
        .invalidate_credentials(&host, &profile.client_id, &profile.api_auth_token, &credential.token)
        .await
      {
        log::warn!("[vpn] Failed to invalidate device credentials: {e}");
      }
    }

    self.connection.reset_connection_info();
    let _ = self.storage.clear_subscriber_credential();
    let _ = self.storage.clear_wireguard_profile();
    let _ = self.storage.set_credential_retried(false);
    if let Some(task) = self.refresh_task.take() {
      task.abort();
    }
    log::info!("[vpn] Credential material cleared");
  }
}

impl Drop for ConnectionManager {
  fn drop(&mut self) {
    if let Some(task) = self.refresh_task.take() {
      task.abort();
    }
  }
}
