//! Fingerprint cache for rule outputs.
//!
//! Entries are grouped per rule so eviction stays lazy: expired entries of a
//! rule are dropped the next time that rule's group is read.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use kat_model::Ooi;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    plugin::{RuleConfig, RuleContext},
    registry::PluginId,
};

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub output: Vec<Ooi>,
    pub computed_at: Instant,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Evaluations that ran uncached because no key could be computed.
    pub uncacheable: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    uncacheable: AtomicU64,
}

/// Process-local derivation cache handle. Clones share the same storage.
///
/// Concurrent misses on one key may both compute; the last insert wins.
#[derive(Clone, Debug, Default)]
pub struct DerivationCache {
    entries: Arc<DashMap<PluginId, HashMap<CacheKey, CacheEntry>>>,
    counters: Arc<Counters>,
}

impl DerivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored output for `key`, unless older than `ttl`. Reading a rule's
    /// entries first evicts every expired entry of that rule.
    pub fn get(
        &self,
        rule: &PluginId,
        key: &CacheKey,
        ttl: Duration,
    ) -> Option<Vec<Ooi>> {
        let hit = self.entries.get_mut(rule).and_then(|mut group| {
            let before = group.len();
            group.retain(|_, entry| entry.computed_at.elapsed() < ttl);
            let evicted = (before - group.len()) as u64;
            if evicted > 0 {
                self.counters
                    .evictions
                    .fetch_add(evicted, Ordering::Relaxed);
                debug!(
                    target: "kat::derive::cache",
                    rule = %rule,
                    evicted,
                    "evicted expired entries"
                );
            }
            group.get(key).map(|entry| entry.output.clone())
        });

        let counter = if hit.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    pub fn insert(&self, rule: &PluginId, key: CacheKey, output: Vec<Ooi>) {
        self.entries.entry(rule.clone()).or_default().insert(
            key,
            CacheEntry {
                output,
                computed_at: Instant::now(),
            },
        );
    }

    pub fn invalidate_rule(&self, rule: &PluginId) {
        self.entries.remove(rule);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|group| group.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_uncacheable(&self) {
        self.counters.uncacheable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            uncacheable: self.counters.uncacheable.load(Ordering::Relaxed),
        }
    }
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    rule: &'a str,
    root: serde_json::Value,
    context: Vec<(&'a str, Vec<String>)>,
    config: &'a RuleConfig,
}

/// Cache key over the rule id, the root object, the resolved context and the
/// configuration. Objects inside a slot are compared as a set, so resolution
/// order never changes the key.
pub fn fingerprint(
    rule: &PluginId,
    root: &Ooi,
    context: &RuleContext,
    config: &RuleConfig,
) -> Result<CacheKey, serde_json::Error> {
    let mut slots = Vec::with_capacity(context.slots.len());
    for slot in &context.slots {
        let mut objects = slot
            .objects
            .iter()
            .map(|ooi| serde_json::to_string(&ooi.object))
            .collect::<Result<Vec<_>, _>>()?;
        objects.sort();
        objects.dedup();
        slots.push((slot.parameter.as_str(), objects));
    }

    let canonical = serde_json::to_vec(&Fingerprint {
        rule: rule.as_str(),
        root: serde_json::to_value(&root.object)?,
        context: slots,
        config,
    })?;

    Ok(CacheKey(hex::encode(Sha256::digest(&canonical))))
}
