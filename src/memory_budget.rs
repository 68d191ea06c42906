//! Process-wide memory-budget arbiter (L4).
//!
//! Tracks byte reservations per named component against a global limit.
//! Never evicts: callers requesting more than available receive `false`
//! and must degrade on their own (smaller batches, fewer in-flight
//! requests).

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct MemoryBudget {
    limit: AtomicU64,
    usage: AtomicU64,
    by_component: DashMap<String, u64>,
}

impl MemoryBudget {
    /// `limit` of 0 means unlimited.
    pub fn new(limit: u64) -> Self {
        Self {
            limit: AtomicU64::new(limit),
            usage: AtomicU64::new(0),
            by_component: DashMap::new(),
        }
    }

    pub fn set_limit(&self, bytes: u64) {
        self.limit.store(bytes, Ordering::SeqCst);
    }

    pub fn is_available(&self, bytes: u64) -> bool {
        let limit = self.limit.load(Ordering::SeqCst);
        if limit == 0 {
            return true;
        }
        self.usage.load(Ordering::SeqCst).saturating_add(bytes) <= limit
    }

    /// Attempts to reserve `bytes` for `component`; returns whether granted.
    pub fn request(&self, component_id: &str, bytes: u64) -> bool {
        let limit = self.limit.load(Ordering::SeqCst);
        loop {
            let current = self.usage.load(Ordering::SeqCst);
            if limit != 0 && current.saturating_add(bytes) > limit {
                return false;
            }
            let new_usage = current + bytes;
            if self
                .usage
                .compare_exchange(current, new_usage, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                *self.by_component.entry(component_id.to_string()).or_insert(0) += bytes;
                return true;
            }
        }
    }

    /// Releases `bytes` for `component`; clamps to zero rather than
    /// underflowing on both the component entry and the global total.
    pub fn release(&self, component_id: &str, bytes: u64) {
        if let Some(mut entry) = self.by_component.get_mut(component_id) {
            let released = bytes.min(*entry);
            *entry -= released;
            self.usage.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |u| {
                Some(u.saturating_sub(released))
            }).ok();
        }
    }

    pub fn current_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    pub fn usage_by_component(&self) -> Vec<(String, u64)> {
        self.by_component
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_within_limit_denies_beyond() {
        let budget = MemoryBudget::new(1000);
        assert!(budget.request("watcher", 600));
        assert!(!budget.request("transfer", 500));
        assert!(budget.request("transfer", 400));
        assert_eq!(budget.current_usage(), 1000);
    }

    #[test]
    fn unlimited_when_zero() {
        let budget = MemoryBudget::new(0);
        assert!(budget.request("anything", u64::MAX / 2));
        assert!(budget.is_available(u64::MAX / 2));
    }

    #[test]
    fn release_clamps_to_zero() {
        let budget = MemoryBudget::new(1000);
        budget.request("watcher", 100);
        budget.release("watcher", 500);
        assert_eq!(budget.current_usage(), 0);
        let usage = budget.usage_by_component();
        assert_eq!(usage, vec![("watcher".to_string(), 0)]);
    }

    #[test]
    fn per_component_usage_sums_to_current_usage() {
        let budget = MemoryBudget::new(0);
        budget.request("a", 100);
        budget.request("b", 50);
        let total: u64 = budget.usage_by_component().iter().map(|(_, v)| v).sum();
        assert_eq!(total, budget.current_usage());
    }
}
