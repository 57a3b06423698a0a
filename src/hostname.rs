//! Load-aware server endpoint selection.

use crate::types::Hostname;

/// Pick the best endpoint from a candidate list: offline hosts are dropped,
/// the remainder is stable-sorted by capacity score descending, and the
/// first survivor wins. Ties keep the backend's original ordering.
///
/// Returns `None` when every candidate is offline; callers must treat that
/// as a failed selection, never as a usable empty hostname.
pub fn pick_best_hostname(hosts: &[Hostname]) -> Option<Hostname> {
  let mut candidates: Vec<&Hostname> = hosts.iter().filter(|h| !h.is_offline).collect();
  candidates.sort_by(|a, b| b.capacity_score.cmp(&a.capacity_score));
  candidates.first().map(|h| (*h).clone())
}
