//! IKEv2 tunnel backend driving the Windows RAS dialer.
//!
//! The phonebook entry is managed through PowerShell's VpnClient cmdlets and
//! dialed with `rasdial`. RAS fires a disconnect notification right after a
//! failed dial, so this backend opts into failure-state suppression.

use super::platform::{PlatformError, PlatformTunnel};
use crate::types::{ConnectionInfo, Ikev2Profile};
use async_trait::async_trait;
use std::process::Command;

pub struct RasTunnel {
  profile: Option<Ikev2Profile>,
}

impl RasTunnel {
  pub fn new() -> Self {
    Self { profile: None }
  }

  fn profile(&self) -> Result<&Ikev2Profile, PlatformError> {
    self
      .profile
      .as_ref()
      .ok_or_else(|| PlatformError::Connect("No tunnel entry created yet".to_string()))
  }

  async fn run(mut command: Command, context: &str) -> Result<String, PlatformError> {
    let context = context.to_string();
    let output = tokio::task::spawn_blocking(move || command.output())
      .await
      .map_err(|e| PlatformError::Connect(format!("Task join failed: {e}")))??;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
      return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() { stdout } else { stderr };
    if message.contains("Access is denied") || message.contains("elevation") {
      return Err(PlatformError::NotAllowed(format!("{context}: {message}")));
    }
    Err(PlatformError::Connect(format!("{context}: {message}")))
  }
}

impl Default for RasTunnel {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PlatformTunnel for RasTunnel {
  async fn create_entry(&mut self, info: &ConnectionInfo) -> Result<(), PlatformError> {
    let profile = match info {
      ConnectionInfo::Ikev2(profile) => profile.clone(),
      ConnectionInfo::WireGuard(_) => {
        return Err(PlatformError::CreateEntry(
          "RAS backend only supports IKEv2 profiles".to_string(),
        ));
      }
    };

    let mut command = Command::new("powershell");
    command.args([
      "-NoProfile",
      "-Command",
      &format!(
        "Add-VpnConnection -Name '{}' -ServerAddress '{}' -TunnelType Ikev2 \
         -AuthenticationMethod Eap -EncryptionLevel Required -Force",
        profile.entry_name, profile.hostname
      ),
    ]);
    Self::run(command, "Add-VpnConnection").await?;

    log::info!("[vpn] RAS entry '{}' created", profile.entry_name);
    self.profile = Some(profile);
    Ok(())
  }

  async fn connect(&mut self) -> Result<(), PlatformError> {
    let profile = self.profile()?.clone();
    log::info!("[vpn] Dialing RAS entry '{}'", profile.entry_name);

    let mut command = Command::new("rasdial");
    command.args([&profile.entry_name, &profile.username, &profile.password]);
    Self::run(command, "rasdial").await?;
    Ok(())
  }

  async fn disconnect(&mut self) -> Result<(), PlatformError> {
    let profile = self.profile()?.clone();
    log::info!("[vpn] Hanging up RAS entry '{}'", profile.entry_name);

    let mut command = Command::new("rasdial");
    command.args([&profile.entry_name, "/disconnect"]);
    Self::run(command, "rasdial /disconnect").await?;
    Ok(())
  }

  async fn check_connection(&mut self) -> Result<bool, PlatformError> {
    let entry_name = self.profile()?.entry_name.clone();

    // `rasdial` with no arguments lists active connections.
    let output = tokio::task::spawn_blocking(|| Command::new("rasdial").output())
      .await
      .map_err(|e| PlatformError::Connect(format!("Task join failed: {e}")))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.contains(&entry_name))
  }

  fn suppress_disconnect_after_failure(&self) -> bool {
    true
  }
}
