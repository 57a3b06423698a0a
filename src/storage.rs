//! Persisted preference store for the VPN core.
//!
//! Holds the selected/device region, the cached region catalog with its
//! fetch timestamp, the on-demand toggle, and credential material.
//! Credential material is encrypted at rest with AES-GCM under a random
//! key kept next to the store with restrictive permissions.

use crate::types::{Region, SubscriberCredential, WireGuardProfile};
use aes_gcm::{
  aead::{Aead, KeyInit},
  Aes256Gcm, Nonce,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Storage format version for migration support
const STORAGE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Storage error: {0}")]
  Storage(String),
  #[error("Encryption error: {0}")]
  Encryption(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Base64 ciphertext plus nonce, as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedBlob {
  data: String,
  nonce: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VpnPrefsData {
  version: u32,
  #[serde(default)]
  selected_region: Option<String>,
  #[serde(default)]
  device_region: Option<String>,
  #[serde(default)]
  region_catalog: Vec<Region>,
  #[serde(default)]
  regions_fetched_at: Option<i64>,
  #[serde(default)]
  subscriber_credential: Option<EncryptedBlob>,
  #[serde(default)]
  subscriber_credential_expires_at: Option<i64>,
  #[serde(default)]
  credential_retried: bool,
  #[serde(default)]
  wireguard_profile: Option<EncryptedBlob>,
  #[serde(default)]
  on_demand_enabled: bool,
}

impl Default for VpnPrefsData {
  fn default() -> Self {
    Self {
      version: STORAGE_VERSION,
      selected_region: None,
      device_region: None,
      region_catalog: Vec::new(),
      regions_fetched_at: None,
      subscriber_credential: None,
      subscriber_credential_expires_at: None,
      credential_retried: false,
      wireguard_profile: None,
      on_demand_enabled: false,
    }
  }
}

/// Preference store with encryption for credential material.
#[derive(Debug, Clone)]
pub struct VpnStorage {
  storage_path: PathBuf,
  encryption_key: [u8; 32],
}

impl Default for VpnStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl VpnStorage {
  /// Create a store in the platform data directory.
  pub fn new() -> Self {
    let dir = Self::default_dir();
    if !dir.exists() {
      let _ = fs::create_dir_all(&dir);
    }
    Self::with_dir(&dir)
  }

  /// Create a store rooted at a custom directory.
  pub fn with_dir(dir: &std::path::Path) -> Self {
    let storage_path = dir.join("vpn_prefs.json");
    let encryption_key = Self::get_or_create_key(&dir.join(".vpn_key"));

    Self {
      storage_path,
      encryption_key,
    }
  }

  fn default_dir() -> PathBuf {
    match directories::ProjectDirs::from("com", "vpncore", "vpncore") {
      Some(dirs) => dirs.data_local_dir().to_path_buf(),
      None => PathBuf::from("."),
    }
  }

  /// Get or create the encryption key
  fn get_or_create_key(key_path: &std::path::Path) -> [u8; 32] {
    if key_path.exists() {
      if let Ok(key_data) = fs::read(key_path) {
        if key_data.len() == 32 {
          let mut key = [0u8; 32];
          key.copy_from_slice(&key_data);
          return key;
        }
      }
    }

    // Generate a new key
    let key: [u8; 32] = rand::rng().random();
    let _ = fs::write(key_path, key);

    // Set restrictive permissions on Unix
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let _ = fs::set_permissions(key_path, fs::Permissions::from_mode(0o600));
    }

    key
  }

  fn load_prefs(&self) -> Result<VpnPrefsData, StorageError> {
    if !self.storage_path.exists() {
      return Ok(VpnPrefsData::default());
    }

    let content = fs::read_to_string(&self.storage_path)
      .map_err(|e| StorageError::Storage(format!("Failed to read storage file: {e}")))?;

    serde_json::from_str(&content)
      .map_err(|e| StorageError::Storage(format!("Failed to parse storage file: {e}")))
  }

  fn save_prefs(&self, data: &VpnPrefsData) -> Result<(), StorageError> {
    let content = serde_json::to_string_pretty(data)
      .map_err(|e| StorageError::Storage(format!("Failed to serialize storage: {e}")))?;

    fs::write(&self.storage_path, content)
      .map_err(|e| StorageError::Storage(format!("Failed to write storage file: {e}")))?;

    Ok(())
  }

  fn encrypt(&self, data: &str) -> Result<EncryptedBlob, StorageError> {
    let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
      .map_err(|e| StorageError::Encryption(format!("Failed to create cipher: {e}")))?;

    let nonce_bytes: [u8; 12] = rand::rng().random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
      .encrypt(nonce, data.as_bytes())
      .map_err(|e| StorageError::Encryption(format!("Encryption failed: {e}")))?;

    Ok(EncryptedBlob {
      data: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &ciphertext),
      nonce: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, nonce_bytes),
    })
  }

  fn decrypt(&self, blob: &EncryptedBlob) -> Result<String, StorageError> {
    let cipher = Aes256Gcm::new_from_slice(&self.encryption_key)
      .map_err(|e| StorageError::Encryption(format!("Failed to create cipher: {e}")))?;

    let ciphertext = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &blob.data)
      .map_err(|e| StorageError::Encryption(format!("Failed to decode ciphertext: {e}")))?;

    let nonce_bytes =
      base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &blob.nonce)
        .map_err(|e| StorageError::Encryption(format!("Failed to decode nonce: {e}")))?;

    if nonce_bytes.len() != 12 {
      return Err(StorageError::Encryption("Invalid nonce length".to_string()));
    }

    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = cipher
      .decrypt(nonce, ciphertext.as_ref())
      .map_err(|e| StorageError::Encryption(format!("Decryption failed: {e}")))?;

    String::from_utf8(plaintext)
      .map_err(|e| StorageError::Encryption(format!("Failed to decode plaintext: {e}")))
  }

  pub fn selected_region(&self) -> Option<String> {
    self.load_prefs().ok().and_then(|p| p.selected_region)
  }

  pub fn set_selected_region(&self, name: &str) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.selected_region = Some(name.to_string());
    self.save_prefs(&prefs)
  }

  pub fn device_region(&self) -> Option<String> {
    self.load_prefs().ok().and_then(|p| p.device_region)
  }

  pub fn set_device_region(&self, name: &str) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.device_region = Some(name.to_string());
    self.save_prefs(&prefs)
  }

  /// Load the cached region catalog with its fetch timestamp. A record
  /// missing a required field invalidates the entire catalog: no partial
  /// trust of on-disk data.
  pub fn region_catalog(&self) -> (Vec<Region>, Option<i64>) {
    let prefs = match self.load_prefs() {
      Ok(p) => p,
      Err(e) => {
        log::warn!("[vpn] Failed to load region cache: {e}");
        return (Vec::new(), None);
      }
    };

    if prefs.region_catalog.is_empty() {
      return (Vec::new(), None);
    }
    if !prefs.region_catalog.iter().all(Region::is_valid) {
      log::warn!("[vpn] Cached region catalog failed validation, discarding");
      return (Vec::new(), None);
    }
    (prefs.region_catalog, prefs.regions_fetched_at)
  }

  pub fn set_region_catalog(&self, regions: &[Region]) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.region_catalog = regions.to_vec();
    prefs.regions_fetched_at = Some(Utc::now().timestamp());
    self.save_prefs(&prefs)
  }

  pub fn subscriber_credential(&self) -> Option<SubscriberCredential> {
    let prefs = self.load_prefs().ok()?;
    let blob = prefs.subscriber_credential?;
    let expires_at = prefs.subscriber_credential_expires_at?;
    match self.decrypt(&blob) {
      Ok(token) => Some(SubscriberCredential { token, expires_at }),
      Err(e) => {
        log::warn!("[vpn] Failed to decrypt subscriber credential: {e}");
        None
      }
    }
  }

  pub fn set_subscriber_credential(
    &self,
    credential: &SubscriberCredential,
  ) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.subscriber_credential = Some(self.encrypt(&credential.token)?);
    prefs.subscriber_credential_expires_at = Some(credential.expires_at);
    self.save_prefs(&prefs)
  }

  pub fn clear_subscriber_credential(&self) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.subscriber_credential = None;
    prefs.subscriber_credential_expires_at = None;
    self.save_prefs(&prefs)
  }

  pub fn has_valid_subscriber_credential(&self) -> bool {
    self
      .subscriber_credential()
      .is_some_and(|c| c.is_valid())
  }

  /// Whether the once-only credential retry has already been consumed.
  /// Persisted so the bound survives a crash mid-negotiation.
  pub fn credential_retried(&self) -> bool {
    self
      .load_prefs()
      .map(|p| p.credential_retried)
      .unwrap_or(false)
  }

  pub fn set_credential_retried(&self, retried: bool) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.credential_retried = retried;
    self.save_prefs(&prefs)
  }

  pub fn wireguard_profile(&self) -> Option<WireGuardProfile> {
    let prefs = self.load_prefs().ok()?;
    let blob = prefs.wireguard_profile?;
    let json = match self.decrypt(&blob) {
      Ok(json) => json,
      Err(e) => {
        log::warn!("[vpn] Failed to decrypt WireGuard profile: {e}");
        return None;
      }
    };
    serde_json::from_str(&json).ok()
  }

  pub fn set_wireguard_profile(&self, profile: &WireGuardProfile) -> Result<(), StorageError> {
    let json = serde_json::to_string(profile)
      .map_err(|e| StorageError::Storage(format!("Failed to serialize profile: {e}")))?;
    let mut prefs = self.load_prefs()?;
    prefs.wireguard_profile = Some(self.encrypt(&json)?);
    self.save_prefs(&prefs)
  }

  pub fn clear_wireguard_profile(&self) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.wireguard_profile = None;
    self.save_prefs(&prefs)
  }

  pub fn on_demand_enabled(&self) -> bool {
    self
      .load_prefs()
      .map(|p| p.on_demand_enabled)
      .unwrap_or(false)
  }

  pub fn set_on_demand_enabled(&self, enabled: bool) -> Result<(), StorageError> {
    let mut prefs = self.load_prefs()?;
    prefs.on_demand_enabled = enabled;
    self.save_prefs(&prefs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn create_test_storage() -> (VpnStorage, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let storage = VpnStorage::with_dir(temp_dir.path());
    (storage, temp_dir)
  }

  fn region(name: &str) -> Region {
    Region {
      name: name.to_string(),
      display_name: name.to_uppercase(),
      continent: "europe".to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn test_selected_and_device_region_roundtrip() {
    let (storage, _temp) = create_test_storage();

    assert!(storage.selected_region().is_none());
    storage.set_selected_region("eu-de").unwrap();
    storage.set_device_region("eu-ch").unwrap();

    assert_eq!(storage.selected_region().as_deref(), Some("eu-de"));
    assert_eq!(storage.device_region().as_deref(), Some("eu-ch"));
  }

  #[test]
  fn test_region_catalog_roundtrip_sets_timestamp() {
    let (storage, _temp) = create_test_storage();

    let (cached, fetched_at) = storage.region_catalog();
    assert!(cached.is_empty());
    assert!(fetched_at.is_none());

    storage
      .set_region_catalog(&[region("eu-de"), region("eu-ch")])
      .unwrap();

    let (cached, fetched_at) = storage.region_catalog();
    assert_eq!(cached.len(), 2);
    assert!(fetched_at.is_some());
  }

  #[test]
  fn test_invalid_cached_record_discards_whole_catalog() {
    let (storage, _temp) = create_test_storage();

    let mut bad = region("eu-nl");
    bad.continent = String::new();
    storage.set_region_catalog(&[region("eu-de"), bad]).unwrap();

    let (cached, _) = storage.region_catalog();
    assert!(cached.is_empty());
  }

  #[test]
  fn test_subscriber_credential_encrypted_roundtrip() {
    let (storage, _temp) = create_test_storage();

    let credential = SubscriberCredential {
      token: "secret-token".to_string(),
      expires_at: Utc::now().timestamp() + 3600,
    };
    storage.set_subscriber_credential(&credential).unwrap();

    // Token must not appear in plaintext on disk.
    let raw = fs::read_to_string(storage.storage_path.clone()).unwrap();
    assert!(!raw.contains("secret-token"));

    let loaded = storage.subscriber_credential().unwrap();
    assert_eq!(loaded.token, "secret-token");
    assert!(storage.has_valid_subscriber_credential());

    storage.clear_subscriber_credential().unwrap();
    assert!(storage.subscriber_credential().is_none());
  }

  #[test]
  fn test_expired_subscriber_credential_not_valid() {
    let (storage, _temp) = create_test_storage();

    let credential = SubscriberCredential {
      token: "old".to_string(),
      expires_at: Utc::now().timestamp() - 10,
    };
    storage.set_subscriber_credential(&credential).unwrap();
    assert!(storage.subscriber_credential().is_some());
    assert!(!storage.has_valid_subscriber_credential());
  }

  #[test]
  fn test_wireguard_profile_encrypted_roundtrip() {
    let (storage, _temp) = create_test_storage();

    let profile = WireGuardProfile {
      public_key: "pub".to_string(),
      private_key: "very-private".to_string(),
      server_public_key: "server-pub".to_string(),
      hostname: "host-1.example.com".to_string(),
      endpoint: "1.2.3.4:51821".to_string(),
      mapped_ipv4: "10.8.0.2".to_string(),
      client_id: "client-1".to_string(),
      api_auth_token: "auth".to_string(),
    };
    storage.set_wireguard_profile(&profile).unwrap();

    let raw = fs::read_to_string(storage.storage_path.clone()).unwrap();
    assert!(!raw.contains("very-private"));

    let loaded = storage.wireguard_profile().unwrap();
    assert_eq!(loaded, profile);

    storage.clear_wireguard_profile().unwrap();
    assert!(storage.wireguard_profile().is_none());
  }

  #[test]
  fn test_credential_retried_flag() {
    let (storage, _temp) = create_test_storage();

    assert!(!storage.credential_retried());
    storage.set_credential_retried(true).unwrap();
    assert!(storage.credential_retried());
    storage.set_credential_retried(false).unwrap();
    assert!(!storage.credential_retried());
  }

  #[test]
  fn test_on_demand_toggle() {
    let (storage, _temp) = create_test_storage();

    assert!(!storage.on_demand_enabled());
    storage.set_on_demand_enabled(true).unwrap();
    assert!(storage.on_demand_enabled());
  }
}
