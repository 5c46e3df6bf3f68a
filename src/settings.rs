//! Per-address settings resolved through wildcard patterns.
//!
//! Addresses are `.`-separated words. In a pattern `*` matches exactly one
//! word and `#` matches any number of words (including none). When several
//! patterns match, each field is taken from the most specific pattern that
//! sets it.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_MAX_SIZE_BYTES: i64 = -1;
pub const DEFAULT_PAGE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;
pub const DEFAULT_DISTRIBUTION_POLICY: &str = "round-robin";

/// What happens to a message sent to an address over `max_size_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFullPolicy {
    /// Write it to the address's page files.
    Page,
    /// Discard it with a warning.
    Drop,
    /// Refuse it with `Error::AddressFull`.
    Block,
}

/// Settings for an address. Unset fields fall back to less specific
/// patterns and finally to the documented defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSettings {
    /// Bytes of in-memory messages allowed before the full policy applies.
    /// Default: -1 (unlimited)
    pub max_size_bytes: Option<i64>,

    /// Size at which a page file is rolled.
    /// Default: 10 MB
    pub page_size_bytes: Option<u64>,

    /// Default: `Page`
    pub address_full_policy: Option<AddressFullPolicy>,

    /// Older flag; `true` behaves like `address_full_policy = drop`.
    pub drop_messages_when_full: Option<bool>,

    /// Deliveries before a message is sent to the dead-letter address.
    /// Default: 10
    pub max_delivery_attempts: Option<u32>,

    /// Delay before a cancelled message is redelivered.
    /// Default: 0
    pub redelivery_delay_ms: Option<u64>,

    pub dead_letter_address: Option<String>,

    pub expiry_address: Option<String>,

    /// Key into the distributor registry.
    /// Default: "round-robin"
    pub distribution_policy: Option<String>,
}

impl AddressSettings {
    pub fn max_size_bytes(&self) -> i64 {
        self.max_size_bytes.unwrap_or(DEFAULT_MAX_SIZE_BYTES)
    }

    pub fn page_size_bytes(&self) -> u64 {
        self.page_size_bytes.unwrap_or(DEFAULT_PAGE_SIZE_BYTES)
    }

    pub fn address_full_policy(&self) -> AddressFullPolicy {
        match (self.address_full_policy, self.drop_messages_when_full) {
            (Some(policy), _) => policy,
            (None, Some(true)) => AddressFullPolicy::Drop,
            _ => AddressFullPolicy::Page,
        }
    }

    pub fn is_drop_messages_when_full(&self) -> bool {
        self.address_full_policy() == AddressFullPolicy::Drop
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
            .unwrap_or(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }

    pub fn redelivery_delay_ms(&self) -> u64 {
        self.redelivery_delay_ms.unwrap_or(0)
    }

    pub fn dead_letter_address(&self) -> Option<&str> {
        self.dead_letter_address.as_deref()
    }

    pub fn expiry_address(&self) -> Option<&str> {
        self.expiry_address.as_deref()
    }

    pub fn distribution_policy(&self) -> &str {
        self.distribution_policy
            .as_deref()
            .unwrap_or(DEFAULT_DISTRIBUTION_POLICY)
    }
}

/// Values that can be layered by specificity.
pub trait Mergeable: Clone + Default {
    /// Fill unset fields of `self` from `fallback`.
    fn merge(&mut self, fallback: &Self);
}

impl Mergeable for AddressSettings {
    fn merge(&mut self, fallback: &Self) {
        fn fill<T: Clone>(slot: &mut Option<T>, from: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(from);
            }
        }
        fill(&mut self.max_size_bytes, &fallback.max_size_bytes);
        fill(&mut self.page_size_bytes, &fallback.page_size_bytes);
        fill(&mut self.address_full_policy, &fallback.address_full_policy);
        fill(
            &mut self.drop_messages_when_full,
            &fallback.drop_messages_when_full,
        );
        fill(
            &mut self.max_delivery_attempts,
            &fallback.max_delivery_attempts,
        );
        fill(&mut self.redelivery_delay_ms, &fallback.redelivery_delay_ms);
        fill(&mut self.dead_letter_address, &fallback.dead_letter_address);
        fill(&mut self.expiry_address, &fallback.expiry_address);
        fill(&mut self.distribution_policy, &fallback.distribution_policy);
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    text: String,
    words: Vec<String>,
}

impl Pattern {
    fn new(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(Error::Config("empty address pattern".into()));
        }
        Ok(Self {
            text: text.to_string(),
            words: text.split('.').map(str::to_string).collect(),
        })
    }

    fn matches(&self, address: &str) -> bool {
        let words: Vec<&str> = address.split('.').collect();
        let pattern: Vec<&str> = self.words.iter().map(String::as_str).collect();
        match_words(&pattern, &words)
    }

    /// Larger is more specific.
    fn specificity(&self) -> (bool, usize, std::cmp::Reverse<usize>, usize) {
        let hashes = self.words.iter().filter(|w| *w == "#").count();
        let stars = self.words.iter().filter(|w| *w == "*").count();
        let literals = self.words.len() - hashes - stars;
        (
            hashes + stars == 0,
            literals,
            std::cmp::Reverse(hashes),
            self.words.len(),
        )
    }
}

fn match_words(pattern: &[&str], address: &[&str]) -> bool {
    match pattern.split_first() {
        None => address.is_empty(),
        Some((&"#", rest)) => (0..=address.len()).any(|skip| match_words(rest, &address[skip..])),
        Some((&"*", rest)) => !address.is_empty() && match_words(rest, &address[1..]),
        Some((word, rest)) => address.first() == Some(word) && match_words(rest, &address[1..]),
    }
}

/// Entries kept in a repository's resolution cache before it is reset.
const MAX_CACHED_ADDRESSES: usize = 1024;

/// Resolves a value for an address from patterns registered with
/// `add_match`. Resolutions of addresses some pattern matches are cached
/// until the patterns change; addresses only the default covers are not.
pub struct HierarchicalRepository<T: Mergeable> {
    default: RwLock<T>,
    matches: RwLock<Vec<(Pattern, T)>>,
    cache: RwLock<HashMap<String, T>>,
}

impl<T: Mergeable> Default for HierarchicalRepository<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Mergeable> HierarchicalRepository<T> {
    pub fn new(default: T) -> Self {
        Self {
            default: RwLock::new(default),
            matches: RwLock::new(Vec::new()),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_default(&self, value: T) -> Result<()> {
        *self.default.write().map_err(Error::poisoned)? = value;
        self.clear_cache()
    }

    /// Register (or replace) the value for `pattern`.
    pub fn add_match(&self, pattern: &str, value: T) -> Result<()> {
        let parsed = Pattern::new(pattern)?;
        {
            let mut matches = self.matches.write().map_err(Error::poisoned)?;
            matches.retain(|(p, _)| p.text != pattern);
            matches.push((parsed, value));
        }
        self.clear_cache()
    }

    pub fn remove_match(&self, pattern: &str) -> Result<()> {
        self.matches
            .write()
            .map_err(Error::poisoned)?
            .retain(|(p, _)| p.text != pattern);
        self.clear_cache()
    }

    pub fn get_match(&self, address: &str) -> Result<T> {
        if let Some(hit) = self.cache.read().map_err(Error::poisoned)?.get(address) {
            return Ok(hit.clone());
        }
        let mut found: Vec<(Pattern, T)> = self
            .matches
            .read()
            .map_err(Error::poisoned)?
            .iter()
            .filter(|(p, _)| p.matches(address))
            .cloned()
            .collect();
        found.sort_by_key(|(p, _)| std::cmp::Reverse(p.specificity()));

        let mut value = T::default();
        for (_, layer) in &found {
            value.merge(layer);
        }
        value.merge(&*self.default.read().map_err(Error::poisoned)?);
        if !found.is_empty() {
            let mut cache = self.cache.write().map_err(Error::poisoned)?;
            if cache.len() >= MAX_CACHED_ADDRESSES {
                cache.clear();
            }
            cache.insert(address.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Number of cached resolutions.
    pub fn cached_len(&self) -> Result<usize> {
        Ok(self.cache.read().map_err(Error::poisoned)?.len())
    }

    fn clear_cache(&self) -> Result<()> {
        self.cache.write().map_err(Error::poisoned)?.clear();
        Ok(())
    }
}
