//! Least-busy peer selector (L13): load-scores peers holding a needed
//! block and picks the lowest-scoring one.

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::cert::pinning::DeviceId;

const ACTIVITY_EWMA_ALPHA: f64 = 0.3;

/// Per-peer activity/CPU signal, updated on request dispatch (`Using`)
/// and completion (`Done`).
#[derive(Debug, Clone, Copy)]
struct DeviceActivityEntry {
    outstanding: u32,
    cpu_hint_pct: f64,
    activity_ewma: f64,
    last_update: Instant,
}

impl DeviceActivityEntry {
    fn new() -> Self {
        Self {
            outstanding: 0,
            cpu_hint_pct: 0.0,
            activity_ewma: 0.0,
            last_update: Instant::now(),
        }
    }

    fn touch_activity(&mut self) {
        let sample = self.outstanding as f64;
        self.activity_ewma = ACTIVITY_EWMA_ALPHA * sample + (1.0 - ACTIVITY_EWMA_ALPHA) * self.activity_ewma;
        self.last_update = Instant::now();
    }

    /// Load score = round(1000 * (0.7*clip(activity/100) + 0.3*clip(cpu/100))).
    fn load_score(&self) -> u32 {
        let activity_component = (self.activity_ewma / 100.0).clamp(0.0, 1.0);
        let cpu_component = (self.cpu_hint_pct / 100.0).clamp(0.0, 1.0);
        (1000.0 * (0.7 * activity_component + 0.3 * cpu_component)).round() as u32
    }
}

/// Tracks outstanding-request and CPU-hint signals per connected peer
/// and selects the least-busy candidate for a block request.
pub struct PeerSelector {
    entries: DashMap<DeviceId, RwLock<DeviceActivityEntry>>,
}

impl PeerSelector {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    fn entry(&self, peer: DeviceId) {
        self.entries.entry(peer).or_insert_with(|| RwLock::new(DeviceActivityEntry::new()));
    }

    /// Marks a request as dispatched to `peer` (`Using`).
    pub fn using(&self, peer: DeviceId) {
        self.entry(peer);
        let slot = self.entries.get(&peer).unwrap();
        let mut activity = slot.write();
        activity.outstanding += 1;
        activity.touch_activity();
    }

    /// Marks a request to `peer` as complete (`Done`).
    pub fn done(&self, peer: DeviceId) {
        self.entry(peer);
        let slot = self.entries.get(&peer).unwrap();
        let mut activity = slot.write();
        activity.outstanding = activity.outstanding.saturating_sub(1);
        activity.touch_activity();
    }

    /// Refreshes the out-of-band CPU hint for `peer` (0..=100).
    pub fn update_cpu_hint(&self, peer: DeviceId, cpu_hint_pct: f64) {
        self.entry(peer);
        let slot = self.entries.get(&peer).unwrap();
        slot.write().cpu_hint_pct = cpu_hint_pct.clamp(0.0, 100.0);
    }

    fn score_of(&self, peer: &DeviceId) -> u32 {
        match self.entries.get(peer) {
            Some(slot) => slot.read().load_score(),
            None => 0,
        }
    }

    /// Returns the index into `candidates` with the lowest load score;
    /// ties broken by input order (the first minimum wins).
    pub fn select(&self, candidates: &[DeviceId]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, peer)| self.score_of(peer))
            .map(|(idx, _)| idx)
    }
}

impl Default for PeerSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_least_busy_among_candidates() {
        let selector = PeerSelector::new();
        let a = [1u8; 32];
        let b = [2u8; 32];

        selector.using(a);
        selector.using(a);
        selector.using(b);

        let chosen = selector.select(&[a, b]).unwrap();
        assert_eq!(chosen, 1);
    }

    #[test]
    fn ties_break_by_input_order() {
        let selector = PeerSelector::new();
        let a = [3u8; 32];
        let b = [4u8; 32];
        assert_eq!(selector.select(&[a, b]), Some(0));
    }

    #[test]
    fn done_reduces_outstanding_and_thus_score() {
        let selector = PeerSelector::new();
        let a = [5u8; 32];
        let b = [6u8; 32];

        selector.using(a);
        selector.using(a);
        selector.using(a);
        selector.done(a);
        selector.done(a);

        let chosen = selector.select(&[a, b]).unwrap();
        assert_eq!(chosen, 1, "peer a still carries decayed load from its recent bursts, so the idle peer b wins");
    }

    #[test]
    fn cpu_hint_contributes_to_score() {
        let selector = PeerSelector::new();
        let a = [7u8; 32];
        let b = [8u8; 32];
        selector.update_cpu_hint(a, 100.0);
        selector.update_cpu_hint(b, 0.0);
        assert_eq!(selector.select(&[a, b]), Some(1));
    }
}
