//! Region catalog ownership: fetch, cache freshness, and device-region
//! inference from the backend's timezone table.

use crate::api_client::VpnApiClient;
use crate::events::VpnEvent;
use crate::storage::VpnStorage;
use crate::types::{parse_region_list, parse_timezone_list, Region};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Cached catalogs older than this trigger a refetch on first use.
const REGION_DATA_TTL_SECS: i64 = 5 * 60 * 60;

#[derive(Error, Debug)]
pub enum RegionError {
  #[error("Region data not ready")]
  NotReady,
}

/// Owns the cached region catalog and the selected/device region choice.
///
/// A malformed or empty fetch never clobbers a previously valid catalog;
/// it only reports "not ready" for this round.
pub struct RegionDataManager {
  api_client: VpnApiClient,
  storage: VpnStorage,
  regions: Vec<Region>,
  last_fetched_at: Option<i64>,
  fetch_in_flight: bool,
  test_timezone: Option<String>,
  events: broadcast::Sender<VpnEvent>,
}

impl RegionDataManager {
  pub fn new(
    api_client: VpnApiClient,
    storage: VpnStorage,
    events: broadcast::Sender<VpnEvent>,
  ) -> Self {
    let (regions, last_fetched_at) = storage.region_catalog();
    if !regions.is_empty() {
      log::info!("[vpn] Loaded {} cached regions", regions.len());
    }
    Self {
      api_client,
      storage,
      regions,
      last_fetched_at,
      fetch_in_flight: false,
      test_timezone: None,
      events,
    }
  }

  pub fn regions(&self) -> &[Region] {
    &self.regions
  }

  pub fn is_ready(&self) -> bool {
    !self.regions.is_empty()
  }

  /// The region a connect attempt should target: the explicit user
  /// selection when set, otherwise the inferred device region. Calling
  /// this before `is_ready()` is a caller bug.
  pub fn selected_region(&self) -> Result<String, RegionError> {
    debug_assert!(self.is_ready(), "selected_region called before is_ready");
    if !self.is_ready() {
      return Err(RegionError::NotReady);
    }
    if let Some(selected) = self.storage.selected_region() {
      if !selected.is_empty() {
        return Ok(selected);
      }
    }
    Ok(self.device_region())
  }

  /// Persist an explicit region choice and notify observers. Membership is
  /// not validated: a transiently unknown region is surfaced back on the
  /// next catalog refresh.
  pub fn set_selected_region(&mut self, name: &str) {
    if let Err(e) = self.storage.set_selected_region(name) {
      log::warn!("[vpn] Failed to persist selected region: {e}");
    }
    let _ = self
      .events
      .send(VpnEvent::SelectedRegionChanged(name.to_string()));
  }

  /// The inferred device region, falling back to the catalog's first
  /// region when inference never succeeded.
  pub fn device_region(&self) -> String {
    if let Some(region) = self.storage.device_region() {
      if !region.is_empty() {
        return region;
      }
    }
    self
      .regions
      .first()
      .map(|r| r.name.clone())
      .unwrap_or_default()
  }

  /// Override the device timezone used for region inference.
  pub fn set_test_timezone(&mut self, timezone: &str) {
    self.test_timezone = Some(timezone.to_string());
  }

  fn device_timezone(&self) -> Option<String> {
    if let Some(tz) = &self.test_timezone {
      return Some(tz.clone());
    }
    iana_time_zone::get_timezone().ok()
  }

  fn cache_is_fresh(&self) -> bool {
    match self.last_fetched_at {
      Some(fetched_at) => Utc::now().timestamp() - fetched_at < REGION_DATA_TTL_SECS,
      None => false,
    }
  }

  /// Refresh the catalog unless a fetch is already in flight or the cache
  /// is younger than the TTL. Fires `RegionDataReady(success)` after the
  /// region fetch; the timezone step cannot turn success into failure.
  pub async fn fetch_if_needed(&mut self) {
    if self.fetch_in_flight {
      log::debug!("[vpn] Region fetch already in flight");
      return;
    }
    if self.is_ready() && self.cache_is_fresh() {
      log::debug!("[vpn] Region cache is fresh, skipping fetch");
      return;
    }

    self.fetch_in_flight = true;

    let region_response = self.api_client.get_server_regions().await;
    let success = match region_response {
      Ok(body) => self.on_fetch_region_list(&body, true),
      Err(e) => {
        log::warn!("[vpn] Region list fetch failed: {e}");
        self.on_fetch_region_list("", false)
      }
    };

    if success {
      let timezone_response = self.api_client.get_timezones_for_regions().await;
      match timezone_response {
        Ok(body) => self.on_fetch_timezones(&body, true),
        Err(e) => {
          log::warn!("[vpn] Timezone fetch failed: {e}");
          self.on_fetch_timezones("", false);
        }
      }
    }

    self.fetch_in_flight = false;
    let _ = self.events.send(VpnEvent::RegionDataReady(success));
  }

  /// Apply a region list response. Returns whether a new catalog was
  /// committed; an empty or malformed list leaves the cached catalog
  /// untouched.
  pub(crate) fn on_fetch_region_list(&mut self, body: &str, fetch_success: bool) -> bool {
    if !fetch_success {
      return false;
    }
    let Some(regions) = parse_region_list(body) else {
      log::warn!("[vpn] Region list response invalid, keeping cached catalog");
      return false;
    };

    log::info!("[vpn] Region catalog updated ({} regions)", regions.len());
    if let Err(e) = self.storage.set_region_catalog(&regions) {
      log::warn!("[vpn] Failed to persist region catalog: {e}");
    }
    self.regions = regions;
    self.last_fetched_at = Some(Utc::now().timestamp());
    true
  }

  /// Apply a timezone table response, inferring the device region. Any
  /// failure falls back to the catalog's first region so callers always
  /// end up with a usable device region.
  pub(crate) fn on_fetch_timezones(&mut self, body: &str, fetch_success: bool) {
    if fetch_success {
      if let (Some(entries), Some(timezone)) = (parse_timezone_list(body), self.device_timezone()) {
        for entry in &entries {
          if entry.timezones.iter().any(|tz| tz == &timezone) {
            let name = entry.name.clone();
            self.commit_device_region(&name);
            return;
          }
        }
      }
    }
    self.set_fallback_device_region();
  }

  pub(crate) fn set_fallback_device_region(&mut self) {
    let Some(first) = self.regions.first().map(|r| r.name.clone()) else {
      return;
    };
    log::info!("[vpn] Using fallback device region {first}");
    self.commit_device_region(&first);
  }

  fn commit_device_region(&mut self, name: &str) {
    if let Err(e) = self.storage.set_device_region(name) {
      log::warn!("[vpn] Failed to persist device region: {e}");
    }
    // The device region doubles as the initial selection for fresh users.
    if self.storage.selected_region().is_none() {
      let _ = self
        .events
        .send(VpnEvent::SelectedRegionChanged(name.to_string()));
    }
  }
}
