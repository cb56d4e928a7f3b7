//! The finite resource pool.

use std::collections::BTreeMap;

use overwatch_types::GovernanceError;
use serde::{Deserialize, Serialize};

use crate::request::ResourceMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Slot {
    total: u64,
    available: u64,
}

/// Point-in-time view of one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub resource_type: String,
    pub total: u64,
    pub available: u64,
    pub allocated: u64,
}

/// Resource type → (total, available), with `available <= total` at all
/// times.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    slots: BTreeMap<String, Slot>,
}

impl ResourcePool {
    pub fn new(totals: &ResourceMap) -> Result<Self, GovernanceError> {
        if totals.is_empty() {
            return Err(GovernanceError::Configuration(
                "resource pool must define at least one resource type".into(),
            ));
        }
        let mut slots = BTreeMap::new();
        for (name, &total) in totals {
            if name.trim().is_empty() || total == 0 {
                return Err(GovernanceError::Configuration(format!(
                    "pool entry {name:?} must have a name and a non-zero total"
                )));
            }
            slots.insert(
                name.clone(),
                Slot {
                    total,
                    available: total,
                },
            );
        }
        Ok(Self { slots })
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.slots.contains_key(resource_type)
    }

    pub fn total(&self, resource_type: &str) -> u64 {
        self.slots.get(resource_type).map_or(0, |s| s.total)
    }

    pub fn available(&self, resource_type: &str) -> u64 {
        self.slots.get(resource_type).map_or(0, |s| s.available)
    }

    /// First resource type for which `visible(type, available)` is below the
    /// requested quantity, with the visible amount.
    pub fn shortfall(
        &self,
        wanted: &ResourceMap,
        visible: impl Fn(u64) -> u64,
    ) -> Option<(String, u64)> {
        wanted.iter().find_map(|(name, &qty)| {
            let seen = visible(self.available(name));
            (seen < qty).then(|| (name.clone(), seen))
        })
    }

    /// Reserve every quantity in `wanted`, or nothing.
    pub fn take(&mut self, wanted: &ResourceMap) -> Result<(), GovernanceError> {
        if let Some((name, available)) = self.shortfall(wanted, |a| a) {
            return Err(GovernanceError::CapacityExhausted(format!(
                "{name}: {available} available"
            )));
        }
        for (name, qty) in wanted {
            if let Some(slot) = self.slots.get_mut(name) {
                slot.available -= qty;
            }
        }
        Ok(())
    }

    /// Return quantities to the pool. Never raises `available` above `total`.
    pub fn give_back(&mut self, returned: &ResourceMap) {
        for (name, qty) in returned {
            if let Some(slot) = self.slots.get_mut(name) {
                slot.available = (slot.available + qty).min(slot.total);
            }
        }
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.slots
            .iter()
            .map(|(name, slot)| PoolStatus {
                resource_type: name.clone(),
                total: slot.total,
                available: slot.available,
                allocated: slot.total - slot.available,
            })
            .collect()
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::resources;

    #[test]
    fn take_is_all_or_nothing() {
        let mut pool = ResourcePool::new(&resources([("cpu", 10), ("gpu", 1)])).unwrap();
        let err = pool.take(&resources([("cpu", 5), ("gpu", 2)])).unwrap_err();
        assert!(matches!(err, GovernanceError::CapacityExhausted(_)));
        assert_eq!(pool.available("cpu"), 10);

        pool.take(&resources([("cpu", 5), ("gpu", 1)])).unwrap();
        assert_eq!(pool.available("cpu"), 5);
        assert_eq!(pool.available("gpu"), 0);
    }

    #[test]
    fn give_back_is_clamped_to_total() {
        let mut pool = ResourcePool::new(&resources([("cpu", 10)])).unwrap();
        pool.take(&resources([("cpu", 4)])).unwrap();
        pool.give_back(&resources([("cpu", 40)]));
        assert_eq!(pool.available("cpu"), 10);
    }

    #[test]
    fn shortfall_uses_visibility() {
        let pool = ResourcePool::new(&resources([("cpu", 100)])).unwrap();
        assert!(pool.shortfall(&resources([("cpu", 60)]), |a| a).is_none());
        assert_eq!(
            pool.shortfall(&resources([("cpu", 60)]), |a| a / 2),
            Some(("cpu".to_string(), 50))
        );
    }

    #[test]
    fn empty_or_zero_pools_are_rejected() {
        assert!(ResourcePool::new(&ResourceMap::new()).is_err());
        assert!(ResourcePool::new(&resources([("cpu", 0)])).is_err());
    }

    #[test]
    fn status_reports_allocated() {
        let mut pool = ResourcePool::new(&resources([("cpu", 8)])).unwrap();
        pool.take(&resources([("cpu", 3)])).unwrap();
        let status = pool.status();
        assert_eq!(status[0].allocated, 3);
        assert_eq!(status[0].available, 5);
    }
}
