//! Static plugin registry: declarations checked against the object schema
//! once at build time, paired with their compiled implementations.

mod definition;
mod entrypoint;

pub use definition::{
    BoefjeDefinition, NormalizerDefinition, PluginDefinition, PluginId,
    RuleDefinition, RuleParameter, boefje_content_tag,
};
pub use entrypoint::{Entrypoint, EntrypointTable};

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

use kat_model::{OoiType, ScanLevel};
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    job::BOEFJE_ERROR_TAG,
    plugin::{Boefje, Normalizer, Rule},
};

pub trait PluginRegistry: Send + Sync {
    fn resolve(&self, id: &PluginId) -> Result<PluginDefinition>;

    fn all(&self) -> Vec<PluginDefinition>;
}

#[derive(Clone)]
pub struct RegisteredBoefje {
    pub definition: BoefjeDefinition,
    /// `None` for Boefjes only reachable through an out-of-process backend.
    pub body: Option<Arc<dyn Boefje>>,
}

#[derive(Clone)]
pub struct RegisteredNormalizer {
    pub definition: NormalizerDefinition,
    pub body: Arc<dyn Normalizer>,
}

#[derive(Clone)]
pub struct RegisteredRule {
    pub definition: RuleDefinition,
    pub body: Arc<dyn Rule>,
}

impl RegisteredRule {
    pub fn id(&self) -> &PluginId {
        &self.definition.id
    }
}

impl fmt::Debug for RegisteredBoefje {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBoefje")
            .field("definition", &self.definition)
            .field("in_process", &self.body.is_some())
            .finish()
    }
}

impl fmt::Debug for RegisteredNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredNormalizer")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for RegisteredRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRule")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct StaticPluginRegistry {
    boefjes: BTreeMap<PluginId, RegisteredBoefje>,
    normalizers: BTreeMap<PluginId, RegisteredNormalizer>,
    rules: BTreeMap<PluginId, RegisteredRule>,
}

impl StaticPluginRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn boefje(&self, id: &PluginId) -> Option<&RegisteredBoefje> {
        self.boefjes.get(id)
    }

    pub fn normalizer(&self, id: &PluginId) -> Option<&RegisteredNormalizer> {
        self.normalizers.get(id)
    }

    pub fn rule(&self, id: &PluginId) -> Option<&RegisteredRule> {
        self.rules.get(id)
    }

    pub fn rules(&self) -> impl Iterator<Item = &RegisteredRule> {
        self.rules.values()
    }

    /// Rules whose root type is `object_type` or one of its supertypes.
    pub fn rules_for_root(&self, object_type: OoiType) -> Vec<&RegisteredRule> {
        self.rules
            .values()
            .filter(|rule| object_type.is_a(rule.definition.consumes))
            .collect()
    }

    /// Rules with a parameter an object of `object_type` can fill.
    pub fn rules_with_parameter(
        &self,
        object_type: OoiType,
    ) -> Vec<(&RegisteredRule, &RuleParameter)> {
        self.rules
            .values()
            .flat_map(|rule| {
                rule.definition
                    .parameters
                    .iter()
                    .filter(move |param| object_type.is_a(param.object_type))
                    .map(move |param| (rule, param))
            })
            .collect()
    }

    /// Normalizers consuming one of `content_tags` or the Boefje id itself.
    /// Error output only reaches normalizers that consume the error tag.
    pub fn normalizers_for(
        &self,
        content_tags: &BTreeSet<String>,
        boefje: &PluginId,
    ) -> Vec<&RegisteredNormalizer> {
        let is_error = content_tags.contains(BOEFJE_ERROR_TAG);
        self.normalizers
            .values()
            .filter(|normalizer| {
                normalizer.definition.consumes.iter().any(|consumed| {
                    if is_error {
                        consumed == BOEFJE_ERROR_TAG
                    } else {
                        content_tags.contains(consumed)
                            || consumed == boefje.as_str()
                    }
                })
            })
            .collect()
    }

    /// Boefjes that may scan an object of `object_type` holding `clearance`.
    pub fn boefjes_for(
        &self,
        object_type: OoiType,
        clearance: ScanLevel,
    ) -> Vec<&RegisteredBoefje> {
        self.boefjes
            .values()
            .filter(|boefje| {
                boefje
                    .definition
                    .consumes
                    .iter()
                    .any(|consumed| object_type.is_a(*consumed))
                    && clearance >= boefje.definition.scan_level
            })
            .collect()
    }
}

impl PluginRegistry for StaticPluginRegistry {
    fn resolve(&self, id: &PluginId) -> Result<PluginDefinition> {
        if let Some(boefje) = self.boefjes.get(id) {
            return Ok(boefje.definition.clone().into());
        }
        if let Some(normalizer) = self.normalizers.get(id) {
            return Ok(normalizer.definition.clone().into());
        }
        self.rules
            .get(id)
            .map(|rule| rule.definition.clone().into())
            .ok_or_else(|| PipelineError::NotFound(format!("plugin {id}")))
    }

    fn all(&self) -> Vec<PluginDefinition> {
        self.boefjes
            .values()
            .map(|b| PluginDefinition::from(b.definition.clone()))
            .chain(
                self.normalizers
                    .values()
                    .map(|n| PluginDefinition::from(n.definition.clone())),
            )
            .chain(
                self.rules
                    .values()
                    .map(|r| PluginDefinition::from(r.definition.clone())),
            )
            .collect()
    }
}

/// Collects declarations and implementations; [`RegistryBuilder::build`]
/// rejects anything inconsistent with the schema.
#[derive(Default)]
pub struct RegistryBuilder {
    boefjes: Vec<RegisteredBoefje>,
    normalizers: Vec<RegisteredNormalizer>,
    rules: Vec<RegisteredRule>,
    errors: Vec<String>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("boefjes", &self.boefjes.len())
            .field("normalizers", &self.normalizers.len())
            .field("rules", &self.rules.len())
            .field("errors", &self.errors)
            .finish()
    }
}

impl RegistryBuilder {
    pub fn boefje(
        mut self,
        definition: BoefjeDefinition,
        body: impl Boefje + 'static,
    ) -> Self {
        self.boefjes.push(RegisteredBoefje {
            definition,
            body: Some(Arc::new(body)),
        });
        self
    }

    /// A Boefje without an in-process implementation.
    pub fn external_boefje(mut self, definition: BoefjeDefinition) -> Self {
        self.boefjes.push(RegisteredBoefje {
            definition,
            body: None,
        });
        self
    }

    pub fn normalizer(
        mut self,
        definition: NormalizerDefinition,
        body: impl Normalizer + 'static,
    ) -> Self {
        self.normalizers.push(RegisteredNormalizer {
            definition,
            body: Arc::new(body),
        });
        self
    }

    pub fn rule(
        mut self,
        definition: RuleDefinition,
        body: impl Rule + 'static,
    ) -> Self {
        self.rules.push(RegisteredRule {
            definition,
            body: Arc::new(body),
        });
        self
    }

    /// Pair a declaration with the implementation named `entrypoint`.
    pub fn with_entrypoint(
        mut self,
        definition: PluginDefinition,
        entrypoint: Option<&str>,
        table: &EntrypointTable,
    ) -> Self {
        let id = definition.id().clone();
        let resolved = entrypoint.map(|name| (name, table.get(name)));
        match (definition, resolved) {
            (PluginDefinition::Boefje(def), None) => {
                self.boefjes.push(RegisteredBoefje {
                    definition: def,
                    body: None,
                });
            }
            (
                PluginDefinition::Boefje(def),
                Some((_, Some(Entrypoint::Boefje(body)))),
            ) => {
                self.boefjes.push(RegisteredBoefje {
                    definition: def,
                    body: Some(body.clone()),
                });
            }
            (
                PluginDefinition::Normalizer(def),
                Some((_, Some(Entrypoint::Normalizer(body)))),
            ) => {
                self.normalizers.push(RegisteredNormalizer {
                    definition: def,
                    body: body.clone(),
                });
            }
            (
                PluginDefinition::Rule(def),
                Some((_, Some(Entrypoint::Rule(body)))),
            ) => {
                self.rules.push(RegisteredRule {
                    definition: def,
                    body: body.clone(),
                });
            }
            (_, None) => self
                .errors
                .push(format!("plugin {id} needs an entrypoint")),
            (_, Some((name, None))) => self
                .errors
                .push(format!("plugin {id}: unknown entrypoint {name:?}")),
            (def, Some((name, Some(found)))) => self.errors.push(format!(
                "plugin {}: entrypoint {name:?} is a {}, not a {}",
                def.id(),
                found.kind(),
                match def {
                    PluginDefinition::Boefje(_) => "boefje",
                    PluginDefinition::Normalizer(_) => "normalizer",
                    PluginDefinition::Rule(_) => "rule",
                }
            )),
        }
        self
    }

    pub fn build(self) -> Result<StaticPluginRegistry> {
        let mut errors = self.errors;
        let mut seen = HashSet::new();

        for boefje in &self.boefjes {
            let def = &boefje.definition;
            if !seen.insert(def.id.clone()) {
                errors.push(format!("duplicate plugin id {}", def.id));
            }
            if def.consumes.is_empty() {
                errors.push(format!("boefje {} consumes nothing", def.id));
            }
        }

        for normalizer in &self.normalizers {
            let def = &normalizer.definition;
            if !seen.insert(def.id.clone()) {
                errors.push(format!("duplicate plugin id {}", def.id));
            }
            if def.consumes.is_empty() {
                errors.push(format!("normalizer {} consumes nothing", def.id));
            }
            for produced in &def.produces {
                if produced.is_abstract() {
                    errors.push(format!(
                        "normalizer {} produces abstract type {produced}",
                        def.id
                    ));
                }
            }
        }

        for rule in &self.rules {
            let def = &rule.definition;
            if !seen.insert(def.id.clone()) {
                errors.push(format!("duplicate plugin id {}", def.id));
            }
            errors.extend(validate_rule(def));
        }

        if !errors.is_empty() {
            return Err(PipelineError::SchemaViolation(errors.join("; ")));
        }

        debug!(
            target: "kat::registry",
            boefjes = self.boefjes.len(),
            normalizers = self.normalizers.len(),
            rules = self.rules.len(),
            "plugin registry built"
        );

        Ok(StaticPluginRegistry {
            boefjes: self
                .boefjes
                .into_iter()
                .map(|b| (b.definition.id.clone(), b))
                .collect(),
            normalizers: self
                .normalizers
                .into_iter()
                .map(|n| (n.definition.id.clone(), n))
                .collect(),
            rules: self
                .rules
                .into_iter()
                .map(|r| (r.definition.id.clone(), r))
                .collect(),
        })
    }
}

fn validate_rule(def: &RuleDefinition) -> Vec<String> {
    let mut errors = Vec::new();
    if def.produces.is_empty() {
        errors.push(format!("rule {} produces nothing", def.id));
    }

    let mut names = HashSet::new();
    for param in &def.parameters {
        if !names.insert(param.name.as_str()) {
            errors.push(format!(
                "rule {} declares parameter {} twice",
                def.id, param.name
            ));
        }
        let path = &param.relation_path;
        if !def.consumes.is_a(path.root()) {
            errors.push(format!(
                "rule {} parameter {}: path starts at {}, root is {}",
                def.id,
                param.name,
                path.root(),
                def.consumes
            ));
        }
        if !param.object_type.overlaps(path.end_type()) {
            errors.push(format!(
                "rule {} parameter {}: path ends at {}, parameter is {}",
                def.id,
                param.name,
                path.end_type(),
                param.object_type
            ));
        }
    }

    if let Some(path) = &def.config_path
        && !def.consumes.is_a(path.root())
    {
        errors.push(format!(
            "rule {} config path starts at {}, root is {}",
            def.id,
            path.root(),
            def.consumes
        ));
    }

    errors
}
