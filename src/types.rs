//! Core data types for the VPN connection lifecycle.

use serde::{Deserialize, Serialize};

/// Tunnel protocol selected for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
  Ikev2,
  WireGuard,
}

impl std::fmt::Display for ProtocolKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ProtocolKind::Ikev2 => write!(f, "IKEv2"),
      ProtocolKind::WireGuard => write!(f, "WireGuard"),
    }
  }
}

/// Connection state as observed by the UI layer.
///
/// Owned by the connection state machine; every mutation goes through
/// `ConnectionApi::update_state` so that suppression rules apply to both
/// request-driven and OS-event-driven transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Connected,
  Disconnecting,
  ConnectFailed,
  ConnectNotAllowed,
}

impl ConnectionState {
  pub fn is_connected(&self) -> bool {
    matches!(self, ConnectionState::Connected)
  }

  pub fn is_in_progress(&self) -> bool {
    matches!(
      self,
      ConnectionState::Connecting | ConnectionState::Disconnecting
    )
  }
}

/// A geographic grouping of VPN servers, optionally containing city-level
/// sub-regions. Field names follow the backend JSON schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Region {
  #[serde(default)]
  pub name: String,
  #[serde(rename = "name-pretty", default)]
  pub display_name: String,
  #[serde(default)]
  pub continent: String,
  #[serde(rename = "country-iso-code", default)]
  pub country_code: String,
  #[serde(default)]
  pub precision: String,
  #[serde(default)]
  pub latitude: f64,
  #[serde(default)]
  pub longitude: f64,
  #[serde(rename = "server-count", default)]
  pub server_count: u32,
  #[serde(default)]
  pub cities: Vec<Region>,
}

impl Region {
  /// Field-by-field validation used both for fresh fetches and for cached
  /// catalogs loaded from disk. A record missing any required field is
  /// invalid, and one invalid record poisons the entire catalog.
  pub fn is_valid(&self) -> bool {
    if self.name.is_empty() || self.display_name.is_empty() || self.continent.is_empty() {
      return false;
    }
    self.cities.iter().all(Region::is_valid)
  }
}

/// A specific server endpoint within a region.
///
/// Ephemeral: fetched per connection attempt, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostname {
  #[serde(default)]
  pub hostname: String,
  #[serde(rename = "display-name", default)]
  pub display_name: String,
  #[serde(rename = "offline", default)]
  pub is_offline: bool,
  #[serde(rename = "capacity-score", default)]
  pub capacity_score: u32,
}

/// Timezone-to-region mapping entry used to infer the device region.
#[derive(Debug, Clone, Deserialize)]
pub struct TimezoneEntry {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub timezones: Vec<String>,
}

/// IKEv2 EAP profile credentials for the OS VPN entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ikev2Profile {
  pub entry_name: String,
  pub hostname: String,
  pub username: String,
  pub password: String,
}

impl Ikev2Profile {
  pub fn is_valid(&self) -> bool {
    !self.entry_name.is_empty()
      && !self.hostname.is_empty()
      && !self.username.is_empty()
      && !self.password.is_empty()
  }
}

/// WireGuard keypair plus peer configuration returned by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireGuardProfile {
  pub public_key: String,
  pub private_key: String,
  pub server_public_key: String,
  /// API host the device was registered with; credential verify and
  /// invalidate calls must target this host, not the tunnel endpoint.
  #[serde(default)]
  pub hostname: String,
  pub endpoint: String,
  /// Tunnel-internal IPv4 address assigned by the backend at registration.
  #[serde(default)]
  pub mapped_ipv4: String,
  pub client_id: String,
  pub api_auth_token: String,
}

impl WireGuardProfile {
  pub fn is_valid(&self) -> bool {
    !self.public_key.is_empty()
      && !self.private_key.is_empty()
      && !self.server_public_key.is_empty()
      && !self.endpoint.is_empty()
      && !self.client_id.is_empty()
      && !self.api_auth_token.is_empty()
  }
}

/// Protocol-specific connection material, owned exclusively by the active
/// connection instance. Invalid until fully populated; cleared on region
/// change, connect failure, or explicit reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionInfo {
  Ikev2(Ikev2Profile),
  WireGuard(WireGuardProfile),
}

impl ConnectionInfo {
  pub fn is_valid(&self) -> bool {
    match self {
      ConnectionInfo::Ikev2(p) => p.is_valid(),
      ConnectionInfo::WireGuard(p) => p.is_valid(),
    }
  }

  pub fn kind(&self) -> ProtocolKind {
    match self {
      ConnectionInfo::Ikev2(_) => ProtocolKind::Ikev2,
      ConnectionInfo::WireGuard(_) => ProtocolKind::WireGuard,
    }
  }
}

/// Backend-issued token proving an active subscription, exchanged for
/// protocol-specific profile credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberCredential {
  pub token: String,
  /// Unix timestamp (seconds) after which the token is no longer accepted.
  pub expires_at: i64,
}

impl SubscriberCredential {
  pub fn is_valid(&self) -> bool {
    !self.token.is_empty() && self.expires_at > chrono::Utc::now().timestamp()
  }
}

/// Parse a region catalog response. Returns `None` for malformed JSON, an
/// empty list, or any record failing validation, so that callers never
/// partially apply bad data over a valid cached catalog.
pub fn parse_region_list(body: &str) -> Option<Vec<Region>> {
  let regions: Vec<Region> = serde_json::from_str(body).ok()?;
  if regions.is_empty() || !regions.iter().all(Region::is_valid) {
    return None;
  }
  Some(regions)
}

/// Parse a hostnames-for-region response. Malformed entries invalidate the
/// whole response, same policy as regions.
pub fn parse_hostname_list(body: &str) -> Option<Vec<Hostname>> {
  let hosts: Vec<Hostname> = serde_json::from_str(body).ok()?;
  if hosts.iter().any(|h| h.hostname.is_empty()) {
    return None;
  }
  Some(hosts)
}

/// Parse the timezone-to-region table.
pub fn parse_timezone_list(body: &str) -> Option<Vec<TimezoneEntry>> {
  let entries: Vec<TimezoneEntry> = serde_json::from_str(body).ok()?;
  if entries.iter().any(|e| e.name.is_empty()) {
    return None;
  }
  Some(entries)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_region_validation() {
    let region = Region {
      name: "eu-de".to_string(),
      display_name: "Germany".to_string(),
      continent: "europe".to_string(),
      ..Default::default()
    };
    assert!(region.is_valid());

    let missing_continent = Region {
      name: "eu-de".to_string(),
      display_name: "Germany".to_string(),
      ..Default::default()
    };
    assert!(!missing_continent.is_valid());
  }

  #[test]
  fn test_region_validation_recurses_into_cities() {
    let mut region = Region {
      name: "us-east".to_string(),
      display_name: "USA East".to_string(),
      continent: "north-america".to_string(),
      ..Default::default()
    };
    region.cities.push(Region {
      name: "us-nyc".to_string(),
      display_name: String::new(), // invalid city
      continent: "north-america".to_string(),
      ..Default::default()
    });
    assert!(!region.is_valid());
  }

  #[test]
  fn test_parse_region_list_rejects_invalid_record() {
    let body = r#"[
      {"name": "eu-de", "name-pretty": "Germany", "continent": "europe"},
      {"name": "", "name-pretty": "Broken", "continent": "europe"}
    ]"#;
    assert!(parse_region_list(body).is_none());
  }

  #[test]
  fn test_parse_region_list_rejects_empty_and_malformed() {
    assert!(parse_region_list("[]").is_none());
    assert!(parse_region_list("{'invalid json':").is_none());
  }

  #[test]
  fn test_parse_region_list_full_record() {
    let body = r#"[{
      "name": "eu-ch",
      "name-pretty": "Switzerland",
      "continent": "europe",
      "country-iso-code": "CH",
      "precision": "country",
      "latitude": 46.8,
      "longitude": 8.2,
      "server-count": 5,
      "cities": []
    }]"#;
    let regions = parse_region_list(body).unwrap();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].name, "eu-ch");
    assert_eq!(regions[0].display_name, "Switzerland");
    assert_eq!(regions[0].country_code, "CH");
    assert_eq!(regions[0].server_count, 5);
  }

  #[test]
  fn test_parse_hostname_list() {
    let body = r#"[
      {"hostname": "host-1.example.com", "display-name": "Host 1", "offline": false, "capacity-score": 2},
      {"hostname": "host-2.example.com", "display-name": "Host 2", "offline": true, "capacity-score": 9}
    ]"#;
    let hosts = parse_hostname_list(body).unwrap();
    assert_eq!(hosts.len(), 2);
    assert!(!hosts[0].is_offline);
    assert!(hosts[1].is_offline);
    assert_eq!(hosts[1].capacity_score, 9);
  }

  #[test]
  fn test_connection_info_validity() {
    let incomplete = ConnectionInfo::Ikev2(Ikev2Profile {
      entry_name: "MyVPN".to_string(),
      hostname: "host-1.example.com".to_string(),
      username: "user".to_string(),
      password: String::new(),
    });
    assert!(!incomplete.is_valid());

    let complete = ConnectionInfo::WireGuard(WireGuardProfile {
      public_key: "pub".to_string(),
      private_key: "priv".to_string(),
      server_public_key: "server-pub".to_string(),
      hostname: "host-1.example.com".to_string(),
      endpoint: "1.2.3.4:51821".to_string(),
      mapped_ipv4: "10.8.0.2".to_string(),
      client_id: "client".to_string(),
      api_auth_token: "token".to_string(),
    });
    assert!(complete.is_valid());
  }

  #[test]
  fn test_subscriber_credential_expiry() {
    let valid = SubscriberCredential {
      token: "abc".to_string(),
      expires_at: chrono::Utc::now().timestamp() + 3600,
    };
    assert!(valid.is_valid());

    let expired = SubscriberCredential {
      token: "abc".to_string(),
      expires_at: chrono::Utc::now().timestamp() - 10,
    };
    assert!(!expired.is_valid());
  }
}
