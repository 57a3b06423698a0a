//! WireGuard credential negotiation.
//!
//! Derives an x25519 keypair locally, registers the public key with the
//! picked server host, and caches the resulting device credentials
//! (encrypted at rest). Subsequent connects verify the cached credentials
//! instead of re-registering; any connect failure wipes them so a stale
//! registration can never wedge the client.

use super::ProtocolStrategy;
use crate::api_client::VpnApiClient;
use crate::credentials::CredentialError;
use crate::storage::VpnStorage;
use crate::types::{ConnectionInfo, Hostname, ProtocolKind, WireGuardProfile};
use async_trait::async_trait;
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::Rng;

/// Default WireGuard port when the backend omits an explicit endpoint.
const WIREGUARD_PORT: u16 = 51821;

/// Generate a fresh x25519 keypair, base64-encoded the way `wg genkey`
/// would print it.
fn generate_keypair() -> (String, String) {
  let bytes: [u8; 32] = rand::rng().random();
  let secret = StaticSecret::from(bytes);
  let public = PublicKey::from(&secret);
  (
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, secret.to_bytes()),
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, public.as_bytes()),
  )
}

pub struct WireGuardStrategy;

impl WireGuardStrategy {
  async fn mint_profile(
    &self,
    client: &VpnApiClient,
    host: &Hostname,
    subscriber_credential: &str,
  ) -> Result<WireGuardProfile, CredentialError> {
    let (private_key, public_key) = generate_keypair();
    let body = client
      .get_wireguard_profile_credentials(&host.hostname, subscriber_credential, &public_key)
      .await?;

    let value: serde_json::Value = serde_json::from_str(&body)
      .map_err(|e| CredentialError::InvalidResponse(format!("Malformed JSON: {e}")))?;
    let field = |key: &str| {
      value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
    };

    let endpoint = value
      .get("endpoint")
      .and_then(|v| v.as_str())
      .map(str::to_string)
      .unwrap_or_else(|| format!("{}:{WIREGUARD_PORT}", host.hostname));

    let profile = WireGuardProfile {
      public_key,
      private_key,
      server_public_key: field("server-public-key"),
      hostname: host.hostname.clone(),
      endpoint,
      mapped_ipv4: field("mapped-ipv4-address"),
      client_id: field("client-id"),
      api_auth_token: field("api-auth-token"),
    };
    if !profile.is_valid() {
      return Err(CredentialError::InvalidResponse(
        "Missing WireGuard device credentials".to_string(),
      ));
    }
    Ok(profile)
  }
}

#[async_trait]
impl ProtocolStrategy for WireGuardStrategy {
  fn kind(&self) -> ProtocolKind {
    ProtocolKind::WireGuard
  }

  async fn negotiate(
    &self,
    client: &VpnApiClient,
    storage: &VpnStorage,
    host: &Hostname,
    subscriber_credential: &str,
  ) -> Result<ConnectionInfo, CredentialError> {
    // Reuse cached device credentials when the backend still accepts them.
    if let Some(cached) = storage.wireguard_profile() {
      if cached.is_valid() {
        match client
          .verify_credentials(
            &host.hostname,
            &cached.client_id,
            &cached.api_auth_token,
            subscriber_credential,
          )
          .await
        {
          Ok(_) => {
            log::info!("[vpn] Reusing verified WireGuard device credentials");
            return Ok(ConnectionInfo::WireGuard(cached));
          }
          Err(e) if e.is_token_no_longer_valid() => {
            return Err(CredentialError::Api(e));
          }
          Err(e) => {
            log::info!("[vpn] Cached WireGuard credentials rejected ({e}), re-registering");
            let _ = storage.clear_wireguard_profile();
          }
        }
      }
    }

    let profile = self.mint_profile(client, host, subscriber_credential).await?;
    if let Err(e) = storage.set_wireguard_profile(&profile) {
      log::warn!("[vpn] Failed to cache WireGuard profile: {e}");
    }
    log::info!(
      "[vpn] WireGuard device registered with {} (client {})",
      host.hostname,
      profile.client_id
    );
    Ok(ConnectionInfo::WireGuard(profile))
  }

  /// Cached device credentials are the most likely culprit when a tunnel
  /// fails to come up; drop them so the next attempt re-registers.
  fn on_connect_failed(&self, storage: &VpnStorage) {
    if storage.wireguard_profile().is_some() {
      log::info!("[vpn] Dropping cached WireGuard credentials after connect failure");
      let _ = storage.clear_wireguard_profile();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{body_partial_json, method, path, path_regex};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn host_for(server: &MockServer) -> Hostname {
    Hostname {
      hostname: server.address().to_string(),
      display_name: "Test Host".to_string(),
      is_offline: false,
      capacity_score: 1,
    }
  }

  fn cached_profile() -> WireGuardProfile {
    WireGuardProfile {
      public_key: "pub".to_string(),
      private_key: "priv".to_string(),
      server_public_key: "server-pub".to_string(),
      hostname: "host-1.example.com".to_string(),
      endpoint: "10.0.0.1:51821".to_string(),
      mapped_ipv4: "10.8.0.2".to_string(),
      client_id: "client-1".to_string(),
      api_auth_token: "auth-1".to_string(),
    }
  }

  #[test]
  fn test_generate_keypair_encoding() {
    let (private_key, public_key) = generate_keypair();
    let engine = &base64::engine::general_purpose::STANDARD;
    assert_eq!(base64::Engine::decode(engine, &private_key).unwrap().len(), 32);
    assert_eq!(base64::Engine::decode(engine, &public_key).unwrap().len(), 32);
    assert_ne!(private_key, public_key);
  }

  #[tokio::test]
  async fn test_negotiate_registers_and_caches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path(
        "/api/v1.3/register-and-create-wireguard-profile-credential",
      ))
      .and(body_partial_json(
        serde_json::json!({ "transport-protocol": "wireguard" }),
      ))
      .respond_with(ResponseTemplate::new(200).set_body_string(
        r#"{
          "server-public-key": "server-pub",
          "client-id": "client-9",
          "api-auth-token": "auth-9"
        }"#,
      ))
      .mount(&server)
      .await;

    let client = VpnApiClient::new(server.uri());
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());
    let host = host_for(&server);

    let info = WireGuardStrategy
      .negotiate(&client, &storage, &host, "credential")
      .await
      .unwrap();

    match info {
      ConnectionInfo::WireGuard(profile) => {
        assert_eq!(profile.client_id, "client-9");
        assert_eq!(profile.server_public_key, "server-pub");
        assert_eq!(profile.endpoint, format!("{}:51821", host.hostname));
        // The registration host is recorded for later verify/invalidate.
        assert_eq!(profile.hostname, host.hostname);
        assert!(!profile.private_key.is_empty());
      }
      other => panic!("unexpected info: {other:?}"),
    }

    // Registration result must land in the credential cache.
    assert!(storage.wireguard_profile().is_some());
  }

  #[tokio::test]
  async fn test_negotiate_reuses_verified_cached_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path_regex(r"^/api/v1\.3/device/.+/verify-credentials$"))
      .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
      .expect(1)
      .mount(&server)
      .await;

    let client = VpnApiClient::new(server.uri());
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());
    storage.set_wireguard_profile(&cached_profile()).unwrap();

    let info = WireGuardStrategy
      .negotiate(&client, &storage, &host_for(&server), "credential")
      .await
      .unwrap();
    match info {
      ConnectionInfo::WireGuard(profile) => assert_eq!(profile.client_id, "client-1"),
      other => panic!("unexpected info: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_rejected_cache_falls_back_to_registration() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path_regex(r"^/api/v1\.3/device/.+/verify-credentials$"))
      .respond_with(ResponseTemplate::new(401).set_body_string(r#"{"error": "expired"}"#))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path(
        "/api/v1.3/register-and-create-wireguard-profile-credential",
      ))
      .respond_with(ResponseTemplate::new(200).set_body_string(
        r#"{
          "server-public-key": "server-pub",
          "client-id": "client-new",
          "api-auth-token": "auth-new"
        }"#,
      ))
      .mount(&server)
      .await;

    let client = VpnApiClient::new(server.uri());
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());
    storage.set_wireguard_profile(&cached_profile()).unwrap();

    let info = WireGuardStrategy
      .negotiate(&client, &storage, &host_for(&server), "credential")
      .await
      .unwrap();
    match info {
      ConnectionInfo::WireGuard(profile) => assert_eq!(profile.client_id, "client-new"),
      other => panic!("unexpected info: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_token_no_longer_valid_bubbles_up() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path_regex(r"^/api/v1\.3/device/.+/verify-credentials$"))
      .respond_with(
        ResponseTemplate::new(401).set_body_string(r#"{"error": "Token No Longer Valid"}"#),
      )
      .mount(&server)
      .await;

    let client = VpnApiClient::new(server.uri());
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());
    storage.set_wireguard_profile(&cached_profile()).unwrap();

    let result = WireGuardStrategy
      .negotiate(&client, &storage, &host_for(&server), "credential")
      .await;
    assert!(result.is_err_and(|e| e.is_token_no_longer_valid()));
    // Cache survives; the caller decides whether to retry with a fresh
    // subscriber credential.
    assert!(storage.wireguard_profile().is_some());
  }

  #[test]
  fn test_on_connect_failed_wipes_cache() {
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());
    storage.set_wireguard_profile(&cached_profile()).unwrap();

    WireGuardStrategy.on_connect_failed(&storage);
    assert!(storage.wireguard_profile().is_none());
  }
}
