// =============================================================================
// Subscription manager — client × (kind, target) routing table
// =============================================================================
//
// Two owned maps kept in sync under one lock:
//
//   by_client : client_id -> { (kind, target) }
//   by_target : (kind, target) -> { client_id }
//
// The reverse index makes "who subscribes to X" an O(1) lookup, which is
// what the publisher hits on every push cycle. Unsubscribe-all runs on
// every disconnect.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::ws::messages::SubscriptionType;

type SubKey = (SubscriptionType, String);

#[derive(Default)]
struct Tables {
    by_client: HashMap<String, HashSet<SubKey>>,
    by_target: HashMap<SubKey, HashSet<String>>,
    total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub total_subscriptions: usize,
    pub total_clients: usize,
    pub total_targets: usize,
    pub strategy_targets: usize,
    pub stock_targets: usize,
    pub market_targets: usize,
}

/// One client subscription as shown on the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
}

#[derive(Default)]
pub struct SubscriptionManager {
    tables: RwLock<Tables>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription; `true` when it is new for this client.
    pub fn subscribe(&self, client_id: &str, kind: SubscriptionType, target: &str) -> bool {
        let key: SubKey = (kind, target.to_string());
        let mut tables = self.tables.write();

        let fresh = tables
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(key.clone());
        if !fresh {
            debug!(client_id, %kind, target, "already subscribed");
            return false;
        }

        tables
            .by_target
            .entry(key)
            .or_default()
            .insert(client_id.to_string());
        tables.total += 1;
        info!(client_id, %kind, target, "subscription added");
        true
    }

    /// Remove a subscription; `true` when it existed.
    pub fn unsubscribe(&self, client_id: &str, kind: SubscriptionType, target: &str) -> bool {
        let key: SubKey = (kind, target.to_string());
        let mut tables = self.tables.write();

        let Some(subs) = tables.by_client.get_mut(client_id) else {
            return false;
        };
        if !subs.remove(&key) {
            return false;
        }
        if subs.is_empty() {
            tables.by_client.remove(client_id);
        }

        if let Some(clients) = tables.by_target.get_mut(&key) {
            clients.remove(client_id);
            if clients.is_empty() {
                tables.by_target.remove(&key);
            }
        }
        tables.total -= 1;
        info!(client_id, %kind, target, "subscription removed");
        true
    }

    /// Drop every subscription of one client; returns how many were
    /// removed.
    pub fn unsubscribe_all(&self, client_id: &str) -> usize {
        let keys: Vec<SubKey> = {
            let tables = self.tables.read();
            match tables.by_client.get(client_id) {
                Some(subs) => subs.iter().cloned().collect(),
                None => return 0,
            }
        };
        let count = keys.len();
        for (kind, target) in keys {
            self.unsubscribe(client_id, kind, &target);
        }
        count
    }

    /// All clients subscribed to `(kind, target)`.
    pub fn subscribers(&self, kind: SubscriptionType, target: &str) -> Vec<String> {
        self.tables
            .read()
            .by_target
            .get(&(kind, target.to_string()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, client_id: &str, kind: SubscriptionType, target: &str) -> bool {
        self.tables
            .read()
            .by_client
            .get(client_id)
            .is_some_and(|subs| subs.contains(&(kind, target.to_string())))
    }

    pub fn client_subscriptions(&self, client_id: &str) -> Vec<SubscriptionEntry> {
        self.tables
            .read()
            .by_client
            .get(client_id)
            .map(|subs| {
                subs.iter()
                    .map(|(kind, target)| SubscriptionEntry {
                        kind: kind.to_string(),
                        target: target.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every target of `kind` with at least one subscriber.
    pub fn targets_of(&self, kind: SubscriptionType) -> Vec<String> {
        self.tables
            .read()
            .by_target
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, target)| target.clone())
            .collect()
    }

    pub fn stats(&self) -> SubscriptionStats {
        let tables = self.tables.read();
        let count_kind = |kind: SubscriptionType| {
            tables.by_target.keys().filter(|(k, _)| *k == kind).count()
        };
        SubscriptionStats {
            total_subscriptions: tables.total,
            total_clients: tables.by_client.len(),
            total_targets: tables.by_target.len(),
            strategy_targets: count_kind(SubscriptionType::Strategy),
            stock_targets: count_kind(SubscriptionType::Stock),
            market_targets: count_kind(SubscriptionType::Market),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_lookup() {
        let manager = SubscriptionManager::new();
        assert!(manager.subscribe("c1", SubscriptionType::Strategy, "volume_wave"));
        assert!(!manager.subscribe("c1", SubscriptionType::Strategy, "volume_wave"));
        assert!(manager.subscribe("c2", SubscriptionType::Strategy, "volume_wave"));

        let mut subs = manager.subscribers(SubscriptionType::Strategy, "volume_wave");
        subs.sort();
        assert_eq!(subs, vec!["c1", "c2"]);
        assert!(manager.is_subscribed("c1", SubscriptionType::Strategy, "volume_wave"));
        assert!(!manager.is_subscribed("c1", SubscriptionType::Stock, "volume_wave"));
    }

    #[test]
    fn unsubscribe_cleans_empty_buckets() {
        let manager = SubscriptionManager::new();
        manager.subscribe("c1", SubscriptionType::Stock, "600519");
        assert!(manager.unsubscribe("c1", SubscriptionType::Stock, "600519"));
        assert!(!manager.unsubscribe("c1", SubscriptionType::Stock, "600519"));

        let stats = manager.stats();
        assert_eq!(stats.total_subscriptions, 0);
        assert_eq!(stats.total_clients, 0);
        assert_eq!(stats.total_targets, 0);
    }

    #[test]
    fn unsubscribe_all_on_disconnect() {
        let manager = SubscriptionManager::new();
        manager.subscribe("c1", SubscriptionType::Strategy, "volume_wave");
        manager.subscribe("c1", SubscriptionType::Stock, "600519");
        manager.subscribe("c1", SubscriptionType::Market, "SH");
        manager.subscribe("c2", SubscriptionType::Stock, "600519");

        assert_eq!(manager.unsubscribe_all("c1"), 3);
        assert_eq!(manager.unsubscribe_all("c1"), 0);

        // c2 is untouched.
        assert_eq!(
            manager.subscribers(SubscriptionType::Stock, "600519"),
            vec!["c2"]
        );
    }

    #[test]
    fn targets_per_kind() {
        let manager = SubscriptionManager::new();
        manager.subscribe("c1", SubscriptionType::Strategy, "volume_wave");
        manager.subscribe("c2", SubscriptionType::Strategy, "trend_continuation");
        manager.subscribe("c3", SubscriptionType::Stock, "600519");

        let mut strategies = manager.targets_of(SubscriptionType::Strategy);
        strategies.sort();
        assert_eq!(strategies, vec!["trend_continuation", "volume_wave"]);
        assert_eq!(manager.targets_of(SubscriptionType::Stock), vec!["600519"]);
        assert!(manager.targets_of(SubscriptionType::Market).is_empty());
    }

    #[test]
    fn stats_by_kind() {
        let manager = SubscriptionManager::new();
        manager.subscribe("c1", SubscriptionType::Strategy, "volume_wave");
        manager.subscribe("c2", SubscriptionType::Stock, "600519");
        manager.subscribe("c2", SubscriptionType::Stock, "000001");

        let stats = manager.stats();
        assert_eq!(stats.total_subscriptions, 3);
        assert_eq!(stats.total_clients, 2);
        assert_eq!(stats.strategy_targets, 1);
        assert_eq!(stats.stock_targets, 2);
        assert_eq!(stats.market_targets, 0);
    }
}
