use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::registry::PluginId;

/// Global knobs that tune the pipeline.
///
/// All fields carry defaults so a partial configuration file only needs to
/// mention what it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker pool sizing and polling.
    pub queue: QueueConfig,
    /// Boefje execution strategy and timeout.
    pub boefje: BoefjeRunnerConfig,
    /// Cache TTL, cycle guard and rule toggles.
    pub derivation: DerivationConfig,
    /// Schedule matching Boefjes for every committed object.
    pub auto_schedule_boefjes: bool,
    /// Organisation new Boefje jobs are filed under.
    pub organization: String,
    /// Capacity of the in-process event bus.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            boefje: BoefjeRunnerConfig::default(),
            derivation: DerivationConfig::default(),
            auto_schedule_boefjes: false,
            organization: "default".to_string(),
            event_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Boefjes block on network and process I/O.
    pub boefje_workers: usize,
    pub normalizer_workers: usize,
    pub derive_workers: usize,
    /// Sleep between polls of an empty queue (milliseconds).
    pub idle_poll_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            boefje_workers: (cpus * 2).min(16),
            normalizer_workers: cpus,
            derive_workers: cpus,
            idle_poll_ms: 50,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BoefjeRunnerConfig {
    /// A scan running longer than this is recorded as an expected failure.
    pub timeout_secs: u64,
    pub backend: BackendConfig,
}

impl Default for BoefjeRunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            backend: BackendConfig::InProcess,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Call the compiled-in Boefje.
    #[default]
    InProcess,
    /// Spawn `program`, write the job as JSON to stdin and read raw output
    /// from stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    /// TTL for cached rule outputs unless a rule declares its own.
    pub default_cache_ttl_secs: u64,
    /// Derivation chains stop re-triggering past this many steps.
    pub max_depth: u32,
    /// Force-enable rules that are disabled by default.
    pub rules_enabled: BTreeSet<PluginId>,
    pub rules_disabled: BTreeSet<PluginId>,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            default_cache_ttl_secs: 3600,
            max_depth: 16,
            rules_enabled: BTreeSet::new(),
            rules_disabled: BTreeSet::new(),
        }
    }
}

impl DerivationConfig {
    pub fn is_enabled(&self, rule: &PluginId, default_enabled: bool) -> bool {
        if self.rules_disabled.contains(rule) {
            return false;
        }
        default_enabled || self.rules_enabled.contains(rule)
    }
}
