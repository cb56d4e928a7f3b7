//! Per-team ceilings and the usage ledger.
//!
//! A team's committed amount is what it holds plus what it has waiting in
//! the queue. A team without a configured ceiling, or a ceiling without an
//! entry for a resource type, is bounded by the pool total.

use std::collections::BTreeMap;

use crate::pool::ResourcePool;
use crate::request::{DenialReason, ResourceMap};

#[derive(Debug, Clone, Default)]
pub struct TeamLedger {
    ceilings: BTreeMap<String, ResourceMap>,
    usage: BTreeMap<String, ResourceMap>,
    pending: BTreeMap<String, ResourceMap>,
}

fn add(map: &mut BTreeMap<String, ResourceMap>, team: &str, amounts: &ResourceMap) {
    let entry = map.entry(team.to_string()).or_default();
    for (name, qty) in amounts {
        *entry.entry(name.clone()).or_default() += qty;
    }
}

fn sub(map: &mut BTreeMap<String, ResourceMap>, team: &str, amounts: &ResourceMap) {
    let Some(entry) = map.get_mut(team) else {
        return;
    };
    for (name, qty) in amounts {
        if let Some(v) = entry.get_mut(name) {
            *v = v.saturating_sub(*qty);
        }
    }
    entry.retain(|_, v| *v > 0);
    if entry.is_empty() {
        map.remove(team);
    }
}

fn get(map: &BTreeMap<String, ResourceMap>, team: &str, resource: &str) -> u64 {
    map.get(team)
        .and_then(|m| m.get(resource))
        .copied()
        .unwrap_or(0)
}

impl TeamLedger {
    pub fn new(ceilings: BTreeMap<String, ResourceMap>) -> Self {
        Self {
            ceilings,
            ..Self::default()
        }
    }

    pub fn ceiling(&self, team: &str, resource: &str, pool: &ResourcePool) -> u64 {
        self.ceilings
            .get(team)
            .and_then(|c| c.get(resource))
            .copied()
            .unwrap_or_else(|| pool.total(resource))
    }

    pub fn committed(&self, team: &str, resource: &str) -> u64 {
        get(&self.usage, team, resource) + get(&self.pending, team, resource)
    }

    /// First resource type on which `wanted` would push `team` over its
    /// ceiling.
    pub fn check(
        &self,
        team: &str,
        wanted: &ResourceMap,
        pool: &ResourcePool,
    ) -> Result<(), DenialReason> {
        for (name, &requested) in wanted {
            let ceiling = self.ceiling(team, name, pool);
            let committed = self.committed(team, name);
            if committed + requested > ceiling {
                return Err(DenialReason::CeilingExceeded {
                    resource: name.clone(),
                    requested,
                    committed,
                    ceiling,
                });
            }
        }
        Ok(())
    }

    pub fn add_usage(&mut self, team: &str, amounts: &ResourceMap) {
        add(&mut self.usage, team, amounts);
    }

    pub fn remove_usage(&mut self, team: &str, amounts: &ResourceMap) {
        sub(&mut self.usage, team, amounts);
    }

    pub fn add_pending(&mut self, team: &str, amounts: &ResourceMap) {
        add(&mut self.pending, team, amounts);
    }

    pub fn remove_pending(&mut self, team: &str, amounts: &ResourceMap) {
        sub(&mut self.pending, team, amounts);
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn usage(&self, team: &str) -> ResourceMap {
        self.usage.get(team).cloned().unwrap_or_default()
    }

    pub fn all_usage(&self) -> BTreeMap<String, ResourceMap> {
        self.usage.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::resources;

    fn setup() -> (TeamLedger, ResourcePool) {
        let mut ceilings = BTreeMap::new();
        ceilings.insert("alpha".to_string(), resources([("cpu", 80)]));
        (
            TeamLedger::new(ceilings),
            ResourcePool::new(&resources([("cpu", 100), ("gpu", 4)])).unwrap(),
        )
    }

    #[test]
    fn missing_ceiling_falls_back_to_pool_total() {
        let (ledger, pool) = setup();
        assert_eq!(ledger.ceiling("alpha", "cpu", &pool), 80);
        assert_eq!(ledger.ceiling("alpha", "gpu", &pool), 4);
        assert_eq!(ledger.ceiling("beta", "cpu", &pool), 100);
    }

    #[test]
    fn pending_counts_towards_ceiling() {
        let (mut ledger, pool) = setup();
        ledger.add_usage("alpha", &resources([("cpu", 30)]));
        ledger.add_pending("alpha", &resources([("cpu", 30)]));
        assert_eq!(ledger.committed("alpha", "cpu"), 60);

        let err = ledger
            .check("alpha", &resources([("cpu", 30)]), &pool)
            .unwrap_err();
        assert!(matches!(err, DenialReason::CeilingExceeded { committed: 60, .. }));
        assert!(ledger.check("alpha", &resources([("cpu", 20)]), &pool).is_ok());
    }

    #[test]
    fn removing_usage_drops_empty_teams() {
        let (mut ledger, _) = setup();
        ledger.add_usage("alpha", &resources([("cpu", 10)]));
        ledger.remove_usage("alpha", &resources([("cpu", 10)]));
        assert!(ledger.usage("alpha").is_empty());
        assert!(ledger.all_usage().is_empty());
    }
}
