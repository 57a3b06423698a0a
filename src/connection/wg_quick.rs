//! WireGuard tunnel backend driving the system `wg-quick` script.
//!
//! Renders the negotiated profile into a config file in a private temp
//! directory and shells out for up/down/status. All process invocations run
//! on the blocking pool.

use super::platform::{PlatformError, PlatformTunnel};
use crate::types::{ConnectionInfo, WireGuardProfile};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

/// Interface name, also the config file stem. Kept short; Linux caps
/// interface names at 15 bytes.
const INTERFACE_NAME: &str = "wgvpn0";

pub struct WgQuickTunnel {
  config_dir: Option<TempDir>,
}

impl WgQuickTunnel {
  pub fn new() -> Self {
    Self { config_dir: None }
  }

  fn find_wg_quick_binary() -> Result<PathBuf, PlatformError> {
    let locations = [
      "/usr/bin/wg-quick",
      "/usr/local/bin/wg-quick",
      "/opt/homebrew/bin/wg-quick",
    ];

    for loc in &locations {
      let path = PathBuf::from(loc);
      if path.exists() {
        return Ok(path);
      }
    }

    if let Ok(output) = Command::new("which").arg("wg-quick").output() {
      if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
          return Ok(PathBuf::from(path));
        }
      }
    }

    Err(PlatformError::CreateEntry(
      "wg-quick binary not found. Please install wireguard-tools.".to_string(),
    ))
  }

  fn render_config(profile: &WireGuardProfile) -> Result<String, PlatformError> {
    if profile.mapped_ipv4.is_empty() {
      return Err(PlatformError::CreateEntry(
        "Profile has no mapped tunnel address".to_string(),
      ));
    }
    Ok(format!(
      "[Interface]\n\
       PrivateKey = {}\n\
       Address = {}/32\n\
       \n\
       [Peer]\n\
       PublicKey = {}\n\
       AllowedIPs = 0.0.0.0/0, ::/0\n\
       Endpoint = {}\n\
       PersistentKeepalive = 25\n",
      profile.private_key, profile.mapped_ipv4, profile.server_public_key, profile.endpoint
    ))
  }

  fn config_path(&self) -> Result<PathBuf, PlatformError> {
    let dir = self.config_dir.as_ref().ok_or_else(|| {
      PlatformError::Connect("No tunnel entry created yet".to_string())
    })?;
    Ok(dir.path().join(format!("{INTERFACE_NAME}.conf")))
  }

  async fn run_wg_quick(action: &str, config_path: PathBuf) -> Result<(), PlatformError> {
    let binary = Self::find_wg_quick_binary()?;
    let action = action.to_string();
    let output = tokio::task::spawn_blocking(move || {
      Command::new(&binary).arg(&action).arg(&config_path).output()
    })
    .await
    .map_err(|e| PlatformError::Connect(format!("Task join failed: {e}")))??;

    if output.status.success() {
      return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Operation not permitted") || stderr.contains("must be run as root") {
      return Err(PlatformError::NotAllowed(stderr));
    }
    Err(PlatformError::Connect(format!(
      "wg-quick exited with {}: {stderr}",
      output.status
    )))
  }
}

impl Default for WgQuickTunnel {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PlatformTunnel for WgQuickTunnel {
  async fn create_entry(&mut self, info: &ConnectionInfo) -> Result<(), PlatformError> {
    let profile = match info {
      ConnectionInfo::WireGuard(profile) => profile,
      ConnectionInfo::Ikev2(_) => {
        return Err(PlatformError::CreateEntry(
          "wg-quick backend only supports WireGuard profiles".to_string(),
        ));
      }
    };

    let config = Self::render_config(profile)?;
    let dir = TempDir::new()?;
    let path = dir.path().join(format!("{INTERFACE_NAME}.conf"));
    std::fs::write(&path, config)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    log::info!("[vpn] WireGuard config written for {INTERFACE_NAME}");
    self.config_dir = Some(dir);
    Ok(())
  }

  async fn connect(&mut self) -> Result<(), PlatformError> {
    let path = self.config_path()?;
    log::info!("[vpn] Bringing up {INTERFACE_NAME} via wg-quick");
    Self::run_wg_quick("up", path).await
  }

  async fn disconnect(&mut self) -> Result<(), PlatformError> {
    let path = self.config_path()?;
    log::info!("[vpn] Bringing down {INTERFACE_NAME} via wg-quick");
    match Self::run_wg_quick("down", path).await {
      Ok(()) => Ok(()),
      // Already down is a success for our purposes.
      Err(PlatformError::Connect(msg)) if msg.contains("is not a WireGuard interface") => Ok(()),
      Err(e) => Err(e),
    }
  }

  async fn check_connection(&mut self) -> Result<bool, PlatformError> {
    let output = tokio::task::spawn_blocking(|| {
      Command::new("wg").arg("show").arg(INTERFACE_NAME).output()
    })
    .await
    .map_err(|e| PlatformError::Connect(format!("Task join failed: {e}")))?;

    match output {
      Ok(output) => Ok(output.status.success()),
      // No `wg` tool means no tunnel we could have created.
      Err(_) => Ok(false),
    }
  }
}
