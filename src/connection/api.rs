//! Connection state machine and connect/disconnect orchestration.
//!
//! All state mutations flow through `update_state`, which applies the same
//! suppression rules to request-driven and OS-event-driven transitions and
//! broadcasts every committed change. The public methods take `&mut self`;
//! the owning manager serializes calls, so at most one connect sequence is
//! ever in flight.

use super::platform::{PlatformError, PlatformTunnel, TunnelEvent};
use super::ProtocolStrategy;
use crate::api_client::{ApiError, PurchaseProof, VpnApiClient};
use crate::credentials::{obtain_subscriber_credential, CredentialError};
use crate::events::VpnEvent;
use crate::hostname::pick_best_hostname;
use crate::storage::VpnStorage;
use crate::types::{parse_hostname_list, ConnectionInfo, ConnectionState};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
enum ConnectError {
  #[error("Connect cancelled")]
  Cancelled,
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error(transparent)]
  Credential(#[from] CredentialError),
  #[error("Hostname list response invalid")]
  InvalidHostnames,
  #[error("No usable hosts in region {0}")]
  NoUsableHost(String),
}

impl ConnectError {
  fn is_network(&self) -> bool {
    matches!(
      self,
      ConnectError::Api(ApiError::Network(_))
        | ConnectError::Credential(CredentialError::Api(ApiError::Network(_)))
    )
  }
}

/// Race a cancellation token against a future. Abandoning the future drops
/// any in-flight request on the floor, which is exactly what a user-initiated
/// cancel wants.
async fn with_cancel<T>(
  cancel: &CancellationToken,
  fut: impl std::future::Future<Output = T>,
) -> Result<T, ConnectError> {
  tokio::select! {
    _ = cancel.cancelled() => Err(ConnectError::Cancelled),
    out = fut => Ok(out),
  }
}

pub struct ConnectionApi {
  strategy: Box<dyn ProtocolStrategy>,
  tunnel: Box<dyn PlatformTunnel>,
  api_client: VpnApiClient,
  storage: VpnStorage,
  proof: PurchaseProof,
  state: ConnectionState,
  last_error: Option<String>,
  connection_info: Option<ConnectionInfo>,
  cancel: CancellationToken,
  /// A disconnect was requested while a connect was in flight.
  cancel_pending: bool,
  /// A new connect should start as soon as the current tunnel is down
  /// (region change while connected).
  reconnect_pending: bool,
  /// A connect failed on a network error and should be retried when
  /// connectivity returns.
  needs_connect: bool,
  target_region: Option<String>,
  events: broadcast::Sender<VpnEvent>,
}

impl ConnectionApi {
  pub fn new(
    strategy: Box<dyn ProtocolStrategy>,
    tunnel: Box<dyn PlatformTunnel>,
    api_client: VpnApiClient,
    storage: VpnStorage,
    proof: PurchaseProof,
    events: broadcast::Sender<VpnEvent>,
  ) -> Self {
    Self {
      strategy,
      tunnel,
      api_client,
      storage,
      proof,
      state: ConnectionState::Disconnected,
      last_error: None,
      connection_info: None,
      cancel: CancellationToken::new(),
      cancel_pending: false,
      reconnect_pending: false,
      needs_connect: false,
      target_region: None,
      events,
    }
  }

  pub fn state(&self) -> ConnectionState {
    self.state
  }

  pub fn last_error(&self) -> Option<&str> {
    self.last_error.as_deref()
  }

  pub fn connection_info(&self) -> Option<&ConnectionInfo> {
    self.connection_info.as_ref()
  }

  /// Drop negotiated connection material so the next connect starts from
  /// scratch. Called on region change and sign-out.
  pub fn reset_connection_info(&mut self) {
    self.connection_info = None;
  }

  pub fn set_on_demand(&mut self, enabled: bool) {
    self.tunnel.set_on_demand(enabled);
  }

  /// The single transition point. Equal-state updates are dropped so
  /// observers never see duplicates; two transitions are suppressed
  /// outright:
  ///
  /// 1. Connecting -> Disconnected, unless a cancel is pending. Spurious
  ///    OS disconnect notifications during tunnel setup must not knock an
  ///    active attempt back to idle.
  /// 2. ConnectFailed -> Disconnected, on platforms whose backend reports
  ///    a disconnect right after a failed dial.
  fn update_state(&mut self, new_state: ConnectionState) {
    if new_state == self.state {
      return;
    }
    if self.state == ConnectionState::Connecting
      && new_state == ConnectionState::Disconnected
      && !self.cancel_pending
    {
      log::debug!("[vpn] Ignoring Disconnected while Connecting");
      return;
    }
    if self.state == ConnectionState::ConnectFailed
      && new_state == ConnectionState::Disconnected
      && self.tunnel.suppress_disconnect_after_failure()
    {
      log::debug!("[vpn] Keeping ConnectFailed visible over trailing Disconnected");
      return;
    }

    log::info!("[vpn] Connection state: {:?} -> {new_state:?}", self.state);
    self.state = new_state;
    let _ = self.events.send(VpnEvent::ConnectionStateChanged(new_state));
  }

  fn fail(&mut self, message: &str, not_allowed: bool) {
    log::warn!("[vpn] Connect failed: {message}");
    self.last_error = Some(message.to_string());
    self.connection_info = None;
    self.strategy.on_connect_failed(&self.storage);
    self.update_state(if not_allowed {
      ConnectionState::ConnectNotAllowed
    } else {
      ConnectionState::ConnectFailed
    });
  }

  /// Record an error that was detected before the connection sequence
  /// could even start (no region data, no subscription).
  pub fn fail_precondition(&mut self, message: &str) {
    self.fail(message, false);
  }

  pub async fn connect(&mut self, region: &str) {
    match self.state {
      ConnectionState::Connecting | ConnectionState::Disconnecting => {
        log::info!("[vpn] Connect ignored, state is {:?}", self.state);
        return;
      }
      ConnectionState::Connected => {
        // Tear down first; the fresh attempt starts once the tunnel
        // confirms it is gone.
        self.reconnect_pending = true;
        self.target_region = Some(region.to_string());
        self.disconnect().await;
        if self.state == ConnectionState::Disconnected
          && std::mem::take(&mut self.reconnect_pending)
        {
          self.start_attempt(region).await;
        }
        return;
      }
      _ => {}
    }
    self.start_attempt(region).await;
  }

  async fn start_attempt(&mut self, region: &str) {
    self.last_error = None;
    self.needs_connect = false;
    self.cancel_pending = false;
    self.cancel = CancellationToken::new();
    self.target_region = Some(region.to_string());
    self.update_state(ConnectionState::Connecting);

    let reusable = self
      .connection_info
      .as_ref()
      .is_some_and(|info| info.is_valid() && info.kind() == self.strategy.kind());
    if !reusable {
      self.connection_info = None;
      if region.is_empty() {
        self.fail("No target region for connection", false);
        return;
      }
      match self.negotiate(region).await {
        Ok(info) => self.connection_info = Some(info),
        Err(ConnectError::Cancelled) => {
          log::info!("[vpn] Connect cancelled during negotiation");
          return;
        }
        Err(e) => {
          if e.is_network() {
            // Retry automatically once connectivity comes back.
            self.needs_connect = true;
          }
          self.fail(&e.to_string(), false);
          return;
        }
      }
    } else {
      log::info!("[vpn] Reusing existing connection info");
    }

    let Some(info) = self.connection_info.clone() else {
      self.fail("No connection info", false);
      return;
    };

    if let Err(e) = self.tunnel.create_entry(&info).await {
      let not_allowed = matches!(e, PlatformError::NotAllowed(_));
      self.fail(&e.to_string(), not_allowed);
      return;
    }
    if self.cancel_pending {
      // User bailed while the entry was being created.
      let _ = self.tunnel.disconnect().await;
      self.update_state(ConnectionState::Disconnected);
      return;
    }

    match self.tunnel.connect().await {
      Ok(()) => {
        if self.cancel_pending {
          log::info!("[vpn] Deferred disconnect after cancelled connect");
          let _ = self.tunnel.disconnect().await;
          self.update_state(ConnectionState::Disconnected);
          return;
        }
        self.update_state(ConnectionState::Connected);
      }
      Err(e) => {
        let not_allowed = matches!(e, PlatformError::NotAllowed(_));
        self.fail(&e.to_string(), not_allowed);
      }
    }
  }

  /// Resolve a server and negotiate protocol credentials for it. A
  /// "token no longer valid" rejection retries exactly once with a fresh
  /// subscriber credential; the consumed-retry flag is persisted so the
  /// bound holds across restarts.
  async fn negotiate(&self, region: &str) -> Result<ConnectionInfo, ConnectError> {
    let cancel = self.cancel.clone();

    let body = with_cancel(&cancel, self.api_client.get_hostnames_for_region(region)).await??;
    let hosts = parse_hostname_list(&body).ok_or(ConnectError::InvalidHostnames)?;
    let host = pick_best_hostname(&hosts)
      .ok_or_else(|| ConnectError::NoUsableHost(region.to_string()))?;
    log::info!("[vpn] Selected host {} for region {region}", host.hostname);

    loop {
      let credential = with_cancel(
        &cancel,
        obtain_subscriber_credential(&self.api_client, &self.storage, &self.proof),
      )
      .await??;

      let result = with_cancel(
        &cancel,
        self
          .strategy
          .negotiate(&self.api_client, &self.storage, &host, &credential.token),
      )
      .await?;

      match result {
        Ok(info) => {
          // A completed negotiation re-arms the once-only retry.
          let _ = self.storage.set_credential_retried(false);
          return Ok(info);
        }
        Err(e) if e.is_token_no_longer_valid() && !self.storage.credential_retried() => {
          log::warn!("[vpn] Subscriber credential rejected, retrying once with a fresh one");
          let _ = self.storage.set_credential_retried(true);
          let _ = self.storage.clear_subscriber_credential();
        }
        Err(e) => return Err(e.into()),
      }
    }
  }

  pub async fn disconnect(&mut self) {
    match self.state {
      ConnectionState::Disconnected | ConnectionState::Disconnecting => {
        log::info!("[vpn] Disconnect ignored, state is {:?}", self.state);
      }
      ConnectionState::Connecting => {
        // Quick cancel: the user sees the result immediately, any
        // in-flight work is abandoned or torn down best effort.
        log::info!("[vpn] Cancelling connect in progress");
        self.cancel_pending = true;
        self.cancel.cancel();
        self.update_state(ConnectionState::Disconnecting);
        self.update_state(ConnectionState::Disconnected);
        if let Err(e) = self.tunnel.disconnect().await {
          log::debug!("[vpn] Teardown after cancel: {e}");
        }
      }
      _ => {
        self.update_state(ConnectionState::Disconnecting);
        match self.tunnel.disconnect().await {
          Ok(()) => self.update_state(ConnectionState::Disconnected),
          Err(e) => {
            // The OS call failed; assume the tunnel is gone rather than
            // wedging in Disconnecting.
            log::warn!("[vpn] Disconnect failed: {e}");
            self.update_state(ConnectionState::Disconnected);
          }
        }
      }
    }
  }

  /// Fold an OS tunnel notification into the state machine.
  pub async fn handle_tunnel_event(&mut self, event: TunnelEvent) {
    log::debug!("[vpn] Tunnel event: {event:?}");
    match event {
      TunnelEvent::Created => {}
      TunnelEvent::CreateFailed(message) | TunnelEvent::ConnectFailed(message) => {
        self.fail(&message, false);
      }
      TunnelEvent::IsConnecting => self.update_state(ConnectionState::Connecting),
      TunnelEvent::Connected => self.update_state(ConnectionState::Connected),
      TunnelEvent::IsDisconnecting => self.update_state(ConnectionState::Disconnecting),
      TunnelEvent::Disconnected => {
        self.update_state(ConnectionState::Disconnected);
        if self.state == ConnectionState::Disconnected
          && std::mem::take(&mut self.reconnect_pending)
        {
          let region = self.target_region.clone().unwrap_or_default();
          log::info!("[vpn] Tunnel down, starting deferred connect");
          self.start_attempt(&region).await;
        }
      }
    }
  }

  /// Reconcile with the live OS state after a connectivity change, and
  /// retry a connect that previously failed on a network error.
  pub async fn handle_network_change(&mut self) {
    match self.tunnel.check_connection().await {
      Ok(true) => self.update_state(ConnectionState::Connected),
      Ok(false) => self.update_state(ConnectionState::Disconnected),
      Err(e) => log::warn!("[vpn] Connection check failed: {e}"),
    }

    if std::mem::take(&mut self.needs_connect) {
      let region = self.target_region.clone().unwrap_or_default();
      log::info!("[vpn] Network is back, retrying connect");
      self.start_attempt(&region).await;
    }
  }
}
