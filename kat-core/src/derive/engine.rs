use std::{
    collections::HashSet,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kat_model::{Config, Finding, Ooi, Reference, ScanLevel};
use tracing::{debug, warn};

use super::{
    cache::{DerivationCache, fingerprint},
    context::{Resolution, load_rule_config, resolve_context},
};
use crate::{
    config::DerivationConfig,
    error::{PipelineError, Result, panic_message},
    events::RuleEvaluation,
    plugin::RuleError,
    registry::{PluginId, RegisteredRule, StaticPluginRegistry},
    store::{GraphStore, OoiEvent, StoreError},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    Disabled,
    BelowMinScanLevel {
        required: ScanLevel,
        actual: ScanLevel,
    },
    /// A mandatory parameter resolved to nothing.
    MissingParameter(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("rule disabled"),
            SkipReason::BelowMinScanLevel { required, actual } => {
                write!(f, "root clearance {actual} below required {required}")
            }
            SkipReason::MissingParameter(name) => {
                write!(f, "mandatory parameter {name} resolved to nothing")
            }
        }
    }
}

#[derive(Debug)]
pub enum RuleStatus {
    Derived { objects: Vec<Ooi>, cached: bool },
    Skipped(SkipReason),
    Failed(PipelineError),
}

/// Result of one (rule, root) evaluation.
#[derive(Debug)]
pub struct RuleOutcome {
    pub rule: PluginId,
    pub root: Ooi,
    pub status: RuleStatus,
}

impl RuleOutcome {
    /// Derived objects; empty for skipped and failed attempts.
    pub fn objects(&self) -> &[Ooi] {
        match &self.status {
            RuleStatus::Derived { objects, .. } => objects,
            _ => &[],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, RuleStatus::Failed(_))
    }

    pub fn evaluation(&self) -> RuleEvaluation {
        match &self.status {
            RuleStatus::Derived { objects, cached } => RuleEvaluation::Derived {
                objects: objects.len(),
                cached: *cached,
            },
            RuleStatus::Skipped(reason) => RuleEvaluation::Skipped {
                reason: reason.to_string(),
            },
            RuleStatus::Failed(err) => RuleEvaluation::Failed {
                error: err.to_string(),
            },
        }
    }
}

/// Matches rules to committed objects, resolves their context and evaluates
/// them through the fingerprint cache.
///
/// The engine never commits what it derives; the caller saves the output and
/// feeds resulting commit events back in.
pub struct DerivationEngine {
    store: Arc<dyn GraphStore>,
    registry: Arc<StaticPluginRegistry>,
    cache: DerivationCache,
    config: DerivationConfig,
}

impl std::fmt::Debug for DerivationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationEngine")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DerivationEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<StaticPluginRegistry>,
        cache: DerivationCache,
        config: DerivationConfig,
    ) -> Self {
        Self {
            store,
            registry,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &DerivationCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<StaticPluginRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DerivationConfig {
        &self.config
    }

    /// Evaluate every rule whose root type is `root`'s type or a supertype.
    pub async fn derive(
        &self,
        root: &Ooi,
        valid_time: DateTime<Utc>,
    ) -> Vec<RuleOutcome> {
        let rules = self.registry.rules_for_root(root.object_type());
        join_all(
            rules
                .into_iter()
                .map(|rule| self.evaluate(rule, root, valid_time)),
        )
        .await
    }

    /// Everything a committed object triggers: rules rooted at it, plus rules
    /// whose context it feeds, evaluated for each root it belongs to.
    pub async fn derive_for_event(
        &self,
        event: &OoiEvent,
        valid_time: DateTime<Utc>,
    ) -> Result<Vec<RuleOutcome>> {
        let Some(object) = self
            .store
            .get(&event.reference, valid_time)
            .await
            .map_err(|err| unreachable_store(&event.reference, err))?
        else {
            debug!(
                target: "kat::derive",
                reference = %event.reference,
                "committed object not visible at valid time"
            );
            return Ok(Vec::new());
        };

        let mut seen: HashSet<(PluginId, Reference)> = HashSet::new();
        let mut targets: Vec<(&RegisteredRule, Ooi)> = Vec::new();

        for rule in self.registry.rules_for_root(object.object_type()) {
            seen.insert((rule.id().clone(), event.reference.clone()));
            targets.push((rule, object.clone()));
        }

        for (rule, root) in self.dependent_roots(&object, valid_time).await? {
            if seen.insert((rule.id().clone(), root.reference())) {
                targets.push((rule, root));
            }
        }

        Ok(join_all(
            targets
                .iter()
                .map(|(rule, root)| self.evaluate(rule, root, valid_time)),
        )
        .await)
    }

    /// Roots whose rule context includes `changed`, found by walking each
    /// matching parameter path backwards.
    async fn dependent_roots(
        &self,
        changed: &Ooi,
        valid_time: DateTime<Utc>,
    ) -> Result<Vec<(&RegisteredRule, Ooi)>> {
        let reference = changed.reference();
        let mut roots = Vec::new();

        let changed_type = changed.object_type();
        for (rule, param) in self.registry.rules_with_parameter(changed_type) {
            let reversed = param.relation_path.reversed();
            let found = self
                .store
                .get_along_relation_path(
                    &reference,
                    &reversed,
                    rule.definition.consumes,
                    valid_time,
                )
                .await
                .map_err(|err| unreachable_store(&reference, err))?;
            roots.extend(found.into_iter().map(|root| (rule, root)));
        }

        if let Some(config) = changed.downcast::<Config>()
            && let Some(rule) =
                self.registry.rule(&PluginId::from(config.bit_id.as_str()))
            && let Some(path) = &rule.definition.config_path
        {
            let found = self
                .store
                .get_along_relation_path(
                    &config.ooi,
                    &path.reversed(),
                    rule.definition.consumes,
                    valid_time,
                )
                .await
                .map_err(|err| unreachable_store(&reference, err))?;
            roots.extend(found.into_iter().map(|root| (rule, root)));
        }

        Ok(roots)
    }

    /// Evaluate a rule by id against `root`.
    pub async fn evaluate_rule(
        &self,
        rule: &PluginId,
        root: &Ooi,
        valid_time: DateTime<Utc>,
    ) -> Result<RuleOutcome> {
        let registered = self
            .registry
            .rule(rule)
            .ok_or_else(|| PipelineError::NotFound(format!("rule {rule}")))?;
        Ok(self.evaluate(registered, root, valid_time).await)
    }

    pub async fn evaluate(
        &self,
        rule: &RegisteredRule,
        root: &Ooi,
        valid_time: DateTime<Utc>,
    ) -> RuleOutcome {
        let status = self.evaluate_status(rule, root, valid_time).await;
        match &status {
            RuleStatus::Failed(err) => warn!(
                target: "kat::derive",
                rule = %rule.id(),
                root = %root.reference(),
                error = %err,
                "rule evaluation failed"
            ),
            RuleStatus::Skipped(reason) => debug!(
                target: "kat::derive",
                rule = %rule.id(),
                root = %root.reference(),
                reason = %reason,
                "rule skipped"
            ),
            RuleStatus::Derived { objects, cached } => debug!(
                target: "kat::derive",
                rule = %rule.id(),
                root = %root.reference(),
                objects = objects.len(),
                cached,
                "rule evaluated"
            ),
        }
        RuleOutcome {
            rule: rule.id().clone(),
            root: root.clone(),
            status,
        }
    }

    async fn evaluate_status(
        &self,
        rule: &RegisteredRule,
        root: &Ooi,
        valid_time: DateTime<Utc>,
    ) -> RuleStatus {
        let def = &rule.definition;
        if !self.config.is_enabled(&def.id, def.default_enabled) {
            return RuleStatus::Skipped(SkipReason::Disabled);
        }
        if root.scan_level() < def.min_scan_level {
            return RuleStatus::Skipped(SkipReason::BelowMinScanLevel {
                required: def.min_scan_level,
                actual: root.scan_level(),
            });
        }

        let store = self.store.as_ref();
        let resolved = resolve_context(store, def, root, valid_time).await;
        let context = match resolved {
            Ok(Resolution::Ready(context)) => context,
            Ok(Resolution::Missing(param)) => {
                return RuleStatus::Skipped(SkipReason::MissingParameter(param));
            }
            Err(err) => return RuleStatus::Failed(err),
        };
        let loaded = load_rule_config(store, def, root, valid_time).await;
        let config = match loaded {
            Ok(config) => config,
            Err(err) => return RuleStatus::Failed(err),
        };

        let key = match fingerprint(&def.id, root, &context, &config) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(
                    target: "kat::derive::cache",
                    rule = %def.id,
                    root = %root.reference(),
                    error = %err,
                    "cache key serialization failed, evaluating without cache"
                );
                self.cache.record_uncacheable();
                None
            }
        };

        let ttl = Duration::from_secs(
            def.cache_ttl_secs
                .unwrap_or(self.config.default_cache_ttl_secs),
        );
        if let Some(key) = &key
            && let Some(objects) = self.cache.get(&def.id, key, ttl)
        {
            debug!(
                target: "kat::derive::cache",
                rule = %def.id,
                key = %key,
                "cache hit"
            );
            return RuleStatus::Derived {
                objects,
                cached: true,
            };
        }

        let body = rule.body.as_ref();
        let output = match catch_unwind(AssertUnwindSafe(|| {
            body.evaluate(root, &context, &config)
        })) {
            Ok(Ok(output)) => output,
            Ok(Err(RuleError(message))) => {
                return RuleStatus::Failed(PipelineError::rule(
                    def.id.as_str(),
                    message,
                ));
            }
            Err(payload) => {
                return RuleStatus::Failed(PipelineError::rule(
                    def.id.as_str(),
                    format!(
                        "rule panicked: {}",
                        panic_message(payload.as_ref())
                    ),
                ));
            }
        };

        if let Err(err) =
            self.validate_output(rule, &output, valid_time).await
        {
            return RuleStatus::Failed(err);
        }

        if let Some(key) = key {
            self.cache.insert(&def.id, key, output.clone());
        }
        RuleStatus::Derived {
            objects: output,
            cached: false,
        }
    }

    /// Output types must be declared and every Finding needs its FindingType
    /// either alongside it or already stored.
    async fn validate_output(
        &self,
        rule: &RegisteredRule,
        output: &[Ooi],
        valid_time: DateTime<Utc>,
    ) -> Result<()> {
        let def = &rule.definition;
        for ooi in output {
            let object_type = ooi.object_type();
            if !def.declares_output(object_type) {
                return Err(PipelineError::rule(
                    def.id.as_str(),
                    format!("emitted undeclared type {object_type}"),
                ));
            }

            let Some(finding) = ooi.downcast::<Finding>() else {
                continue;
            };
            let co_emitted = output
                .iter()
                .any(|other| other.reference() == finding.finding_type);
            if co_emitted {
                continue;
            }
            let stored = self
                .store
                .get(&finding.finding_type, valid_time)
                .await
                .map_err(|err| unreachable_store(&finding.finding_type, err))?;
            if stored.is_none() {
                return Err(PipelineError::rule(
                    def.id.as_str(),
                    format!(
                        "finding references unknown type {}",
                        finding.finding_type
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn unreachable_store(reference: &Reference, err: StoreError) -> PipelineError {
    PipelineError::ContextResolution(format!("{reference}: {err}"))
}
