//! Stateless HTTP/JSON request wrapper for the credential backend.
//!
//! One method per backend operation. Every method returns the raw response
//! body on HTTP 2xx, or a best-effort parsed error description otherwise.
//! Retry policy lives in the callers, never here.

use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Error message fragment the backend returns when a subscriber credential
/// has been consumed or revoked. Drives the once-only credential retry.
pub const TOKEN_NO_LONGER_VALID: &str = "Token No Longer Valid";

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("Request failed: {0}")]
  Network(#[from] reqwest::Error),
  #[error("Backend error (HTTP {status}): {message}")]
  Backend { status: u16, message: String },
}

impl ApiError {
  /// True when the backend rejected the subscriber credential as consumed.
  pub fn is_token_no_longer_valid(&self) -> bool {
    matches!(self, ApiError::Backend { message, .. } if message.contains(TOKEN_NO_LONGER_VALID))
  }

  pub fn message(&self) -> String {
    match self {
      ApiError::Network(e) => e.to_string(),
      ApiError::Backend { message, .. } => message.clone(),
    }
  }
}

/// Proof of purchase presented when minting a subscriber credential.
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseProof {
  #[serde(rename = "purchase-token")]
  pub purchase_token: String,
  #[serde(rename = "product-id")]
  pub product_id: String,
  #[serde(rename = "product-type")]
  pub product_type: String,
}

/// Stateless request facade for the VPN backend.
///
/// Region and credential-issuance calls go to the API base; profile
/// credential calls target the picked server hostname directly.
#[derive(Debug, Clone)]
pub struct VpnApiClient {
  client: Client,
  base_url: String,
}

impl VpnApiClient {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      client: Client::new(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
    }
  }

  fn api_url(&self, path: &str) -> String {
    format!("{}{path}", self.base_url)
  }

  /// Build a URL targeting a specific server host, keeping the scheme of
  /// the configured base so test backends can run over plain HTTP.
  fn host_url(&self, hostname: &str, path: &str) -> String {
    let scheme = if self.base_url.starts_with("http://") {
      "http"
    } else {
      "https"
    };
    format!("{scheme}://{hostname}{path}")
  }

  async fn get(&self, url: &str) -> Result<String, ApiError> {
    log::debug!("[vpn] GET {url}");
    let response = self.client.get(url).send().await?;
    Self::read_response(response).await
  }

  async fn post(&self, url: &str, body: serde_json::Value) -> Result<String, ApiError> {
    log::debug!("[vpn] POST {url}");
    let response = self.client.post(url).json(&body).send().await?;
    Self::read_response(response).await
  }

  async fn post_authorized(
    &self,
    url: &str,
    auth_token: &str,
    body: serde_json::Value,
  ) -> Result<String, ApiError> {
    log::debug!("[vpn] POST {url}");
    let response = self
      .client
      .post(url)
      .bearer_auth(auth_token)
      .json(&body)
      .send()
      .await?;
    Self::read_response(response).await
  }

  async fn read_response(response: reqwest::Response) -> Result<String, ApiError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
      return Ok(body);
    }
    Err(ApiError::Backend {
      status: status.as_u16(),
      message: parse_error_body(&body, status.as_u16()),
    })
  }

  /// Fetch the region catalog.
  pub async fn get_server_regions(&self) -> Result<String, ApiError> {
    self.get(&self.api_url("/api/v1.1/server-regions")).await
  }

  /// Fetch the timezone-to-region table used for device-region inference.
  pub async fn get_timezones_for_regions(&self) -> Result<String, ApiError> {
    self
      .get(&self.api_url("/api/v1/timezones-for-regions"))
      .await
  }

  /// Fetch candidate endpoints for a region.
  pub async fn get_hostnames_for_region(&self, region: &str) -> Result<String, ApiError> {
    let url = format!(
      "{}?region={region}",
      self.api_url("/api/v1/hostnames-for-region")
    );
    self.get(&url).await
  }

  /// Exchange a purchase proof for a subscriber credential.
  pub async fn get_subscriber_credential(&self, proof: &PurchaseProof) -> Result<String, ApiError> {
    let body = serde_json::to_value(proof).unwrap_or_default();
    self
      .post(&self.api_url("/api/v1.2/subscriber-credential"), body)
      .await
  }

  /// Exchange a subscriber credential for IKEv2 EAP credentials at the
  /// picked server host.
  pub async fn get_ikev2_profile_credentials(
    &self,
    hostname: &str,
    subscriber_credential: &str,
  ) -> Result<String, ApiError> {
    let url = self.host_url(
      hostname,
      "/api/v1.1/register-and-create-ikev2-profile-credential",
    );
    self
      .post(
        &url,
        json!({ "subscriber-credential": subscriber_credential }),
      )
      .await
  }

  /// Register a WireGuard public key and receive peer configuration from
  /// the picked server host.
  pub async fn get_wireguard_profile_credentials(
    &self,
    hostname: &str,
    subscriber_credential: &str,
    public_key: &str,
  ) -> Result<String, ApiError> {
    let url = self.host_url(
      hostname,
      "/api/v1.3/register-and-create-wireguard-profile-credential",
    );
    self
      .post(
        &url,
        json!({
          "subscriber-credential": subscriber_credential,
          "public-key": public_key,
          "transport-protocol": "wireguard",
        }),
      )
      .await
  }

  /// Verify previously issued WireGuard device credentials are still good.
  pub async fn verify_credentials(
    &self,
    hostname: &str,
    client_id: &str,
    api_auth_token: &str,
    subscriber_credential: &str,
  ) -> Result<String, ApiError> {
    let url = self.host_url(
      hostname,
      &format!("/api/v1.3/device/{client_id}/verify-credentials"),
    );
    self
      .post_authorized(
        &url,
        api_auth_token,
        json!({ "subscriber-credential": subscriber_credential }),
      )
      .await
  }

  /// Invalidate WireGuard device credentials (sign-out path, best effort).
  pub async fn invalidate_credentials(
    &self,
    hostname: &str,
    client_id: &str,
    api_auth_token: &str,
    subscriber_credential: &str,
  ) -> Result<String, ApiError> {
    let url = self.host_url(
      hostname,
      &format!("/api/v1.3/device/{client_id}/invalidate-credentials"),
    );
    self
      .post_authorized(
        &url,
        api_auth_token,
        json!({ "subscriber-credential": subscriber_credential }),
      )
      .await
  }

  /// Verify a purchase token with the backend.
  pub async fn verify_purchase_token(
    &self,
    purchase_token: &str,
    product_id: &str,
    product_type: &str,
  ) -> Result<String, ApiError> {
    self
      .post(
        &self.api_url("/api/v1.1/verify-purchase-token"),
        json!({
          "purchase-token": purchase_token,
          "product-id": product_id,
          "product-type": product_type,
        }),
      )
      .await
  }

  /// Submit a support ticket.
  pub async fn create_support_ticket(
    &self,
    email: &str,
    subject: &str,
    body: &str,
  ) -> Result<String, ApiError> {
    self
      .post(
        &self.api_url("/api/v1.2/partner-client/ticket"),
        json!({
          "support-ticket-email": email,
          "support-ticket-subject": subject,
          "support-ticket-support-body": body,
        }),
      )
      .await
  }
}

/// Pull a human-readable description out of an error response body.
fn parse_error_body(body: &str, status: u16) -> String {
  if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
    for key in ["error", "message"] {
      if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
        if !msg.is_empty() {
          return msg.to_string();
        }
      }
    }
  }
  let trimmed = body.trim();
  if trimmed.is_empty() {
    format!("HTTP {status}")
  } else {
    trimmed.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_error_body_json_error_field() {
    assert_eq!(
      parse_error_body(r#"{"error": "Token No Longer Valid"}"#, 401),
      "Token No Longer Valid"
    );
  }

  #[test]
  fn test_parse_error_body_json_message_field() {
    assert_eq!(
      parse_error_body(r#"{"message": "region unknown"}"#, 400),
      "region unknown"
    );
  }

  #[test]
  fn test_parse_error_body_raw_and_empty() {
    assert_eq!(parse_error_body("plain failure", 500), "plain failure");
    assert_eq!(parse_error_body("", 503), "HTTP 503");
  }

  #[test]
  fn test_token_no_longer_valid_detection() {
    let err = ApiError::Backend {
      status: 401,
      message: "Token No Longer Valid".to_string(),
    };
    assert!(err.is_token_no_longer_valid());

    let other = ApiError::Backend {
      status: 401,
      message: "unauthorized".to_string(),
    };
    assert!(!other.is_token_no_longer_valid());
  }

  #[test]
  fn test_host_url_keeps_base_scheme() {
    let https = VpnApiClient::new("https://api.example.com");
    assert_eq!(
      https.host_url("host-1.example.com", "/x"),
      "https://host-1.example.com/x"
    );

    let http = VpnApiClient::new("http://127.0.0.1:9000");
    assert_eq!(
      http.host_url("127.0.0.1:9000", "/x"),
      "http://127.0.0.1:9000/x"
    );
  }

  #[test]
  fn test_base_url_trailing_slash_trimmed() {
    let client = VpnApiClient::new("https://api.example.com/");
    assert_eq!(
      client.api_url("/api/v1.1/server-regions"),
      "https://api.example.com/api/v1.1/server-regions"
    );
  }
}
