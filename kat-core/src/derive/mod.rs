//! Bit/Nibble evaluation: rule matching, context resolution, fingerprint
//! caching and output validation.

mod cache;
mod context;
mod engine;

pub use cache::{CacheEntry, CacheKey, CacheStats, DerivationCache, fingerprint};
pub use engine::{DerivationEngine, RuleOutcome, RuleStatus, SkipReason};
