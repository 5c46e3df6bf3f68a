use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::{Error, Result};

/// Picks the consumer to offer the next reference to.
pub trait Distributor: Send + Sync {
    /// Position to try after `pos` among `consumer_count` consumers.
    fn select(&self, consumer_count: usize, pos: usize) -> usize;
}

/// Built-in distribution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Rotate through consumers.
    RoundRobin,
    /// Only ever offer to the first consumer.
    Single,
}

impl Distribution {
    pub const ROUND_ROBIN: &'static str = "round-robin";
    pub const SINGLE: &'static str = "single";
}

impl Distributor for Distribution {
    fn select(&self, consumer_count: usize, pos: usize) -> usize {
        match self {
            Distribution::RoundRobin if consumer_count > 0 => (pos + 1) % consumer_count,
            _ => 0,
        }
    }
}

pub type DistributorFactory = Arc<dyn Fn() -> Arc<dyn Distributor> + Send + Sync>;

/// Distribution policies by configuration key.
pub struct DistributorRegistry {
    factories: RwLock<HashMap<String, DistributorFactory>>,
}

impl Default for DistributorRegistry {
    fn default() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        if let Ok(mut factories) = registry.factories.write() {
            let round_robin: DistributorFactory = Arc::new(|| Arc::new(Distribution::RoundRobin));
            let single: DistributorFactory = Arc::new(|| Arc::new(Distribution::Single));
            factories.insert(Distribution::ROUND_ROBIN.to_string(), round_robin);
            factories.insert(Distribution::SINGLE.to_string(), single);
        }
        registry
    }
}

impl DistributorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `key`.
    pub fn register(&self, key: impl Into<String>, factory: DistributorFactory) -> Result<()> {
        self.factories
            .write()
            .map_err(Error::poisoned)?
            .insert(key.into(), factory);
        Ok(())
    }

    pub fn create(&self, key: &str) -> Result<Arc<dyn Distributor>> {
        let factories = self.factories.read().map_err(Error::poisoned)?;
        let factory = factories
            .get(key)
            .ok_or_else(|| Error::Config(format!("unknown distribution policy `{key}`")))?;
        Ok(factory())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .factories
            .read()
            .map_err(Error::poisoned)?
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Last;

    impl Distributor for Last {
        fn select(&self, consumer_count: usize, _pos: usize) -> usize {
            consumer_count.saturating_sub(1)
        }
    }

    #[test]
    fn round_robin_wraps() {
        let policy = Distribution::RoundRobin;
        assert_eq!(policy.select(3, 0), 1);
        assert_eq!(policy.select(3, 2), 0);
        assert_eq!(policy.select(0, 0), 0);
        assert_eq!(Distribution::Single.select(3, 1), 0);
    }

    #[test]
    fn registry_knows_builtins_and_extensions() {
        let registry = DistributorRegistry::new();
        assert_eq!(registry.keys().unwrap(), vec!["round-robin", "single"]);
        assert_eq!(registry.create("round-robin").unwrap().select(2, 0), 1);
        assert!(matches!(registry.create("random"), Err(Error::Config(_))));

        registry
            .register("last", Arc::new(|| Arc::new(Last)))
            .unwrap();
        assert_eq!(registry.create("last").unwrap().select(4, 0), 3);
    }
}
