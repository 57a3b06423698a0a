//! IKEv2 credential negotiation.
//!
//! Exchanges a subscriber credential for EAP username/password at the picked
//! server host. The resulting profile is transient; a failed connect simply
//! drops it and the next attempt negotiates fresh credentials.

use super::ProtocolStrategy;
use crate::api_client::VpnApiClient;
use crate::credentials::CredentialError;
use crate::storage::VpnStorage;
use crate::types::{ConnectionInfo, Hostname, Ikev2Profile, ProtocolKind};
use async_trait::async_trait;

pub struct Ikev2Strategy {
  /// Display name for the OS VPN entry.
  entry_name: String,
}

impl Ikev2Strategy {
  pub fn new(entry_name: impl Into<String>) -> Self {
    Self {
      entry_name: entry_name.into(),
    }
  }
}

#[async_trait]
impl ProtocolStrategy for Ikev2Strategy {
  fn kind(&self) -> ProtocolKind {
    ProtocolKind::Ikev2
  }

  async fn negotiate(
    &self,
    client: &VpnApiClient,
    _storage: &VpnStorage,
    host: &Hostname,
    subscriber_credential: &str,
  ) -> Result<ConnectionInfo, CredentialError> {
    let body = client
      .get_ikev2_profile_credentials(&host.hostname, subscriber_credential)
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

    let profile = Ikev2Profile {
      entry_name: self.entry_name.clone(),
      hostname: host.hostname.clone(),
      username: field("eap-username"),
      password: field("eap-password"),
    };
    if !profile.is_valid() {
      return Err(CredentialError::InvalidResponse(
        "Missing EAP credentials".to_string(),
      ));
    }

    log::info!("[vpn] IKEv2 profile credentials issued for {}", host.hostname);
    Ok(ConnectionInfo::Ikev2(profile))
  }

  fn on_connect_failed(&self, _storage: &VpnStorage) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn host_for(server: &MockServer) -> Hostname {
    Hostname {
      hostname: server.address().to_string(),
      display_name: "Test Host".to_string(),
      is_offline: false,
      capacity_score: 1,
    }
  }

  #[tokio::test]
  async fn test_negotiate_builds_profile() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path(
        "/api/v1.1/register-and-create-ikev2-profile-credential",
      ))
      .respond_with(ResponseTemplate::new(200).set_body_string(
        r#"{"eap-username": "user-1", "eap-password": "pass-1"}"#,
      ))
      .mount(&server)
      .await;

    let client = VpnApiClient::new(server.uri());
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());

    let strategy = Ikev2Strategy::new("MyVPN");
    let info = strategy
      .negotiate(&client, &storage, &host_for(&server), "credential")
      .await
      .unwrap();

    match info {
      ConnectionInfo::Ikev2(profile) => {
        assert_eq!(profile.entry_name, "MyVPN");
        assert_eq!(profile.username, "user-1");
        assert_eq!(profile.password, "pass-1");
        assert_eq!(profile.hostname, server.address().to_string());
      }
      other => panic!("unexpected info: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_negotiate_rejects_incomplete_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(
        ResponseTemplate::new(200).set_body_string(r#"{"eap-username": "user-1"}"#),
      )
      .mount(&server)
      .await;

    let client = VpnApiClient::new(server.uri());
    let temp = tempfile::TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp.path());

    let strategy = Ikev2Strategy::new("MyVPN");
    let result = strategy
      .negotiate(&client, &storage, &host_for(&server), "credential")
      .await;
    assert!(matches!(result, Err(CredentialError::InvalidResponse(_))));
  }
}
