use std::{collections::BTreeSet, fmt};

use kat_model::{OoiType, RelationPath, ScanLevel};
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PluginId(String);

impl PluginId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PluginId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Content tag every successful raw output of `boefje` carries.
pub fn boefje_content_tag(boefje: &PluginId) -> String {
    format!("boefje/{boefje}")
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoefjeDefinition {
    pub id: PluginId,
    #[serde(default)]
    pub version: Option<String>,
    pub consumes: BTreeSet<OoiType>,
    /// Content tags of the raw output.
    #[serde(default)]
    pub produces: BTreeSet<String>,
    /// Clearance an input object needs before this Boefje may scan it.
    #[serde(default)]
    pub scan_level: ScanLevel,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NormalizerDefinition {
    pub id: PluginId,
    /// Content tags or Boefje ids this normalizer parses.
    pub consumes: BTreeSet<String>,
    pub produces: BTreeSet<OoiType>,
}

/// One context input of a rule, resolved by walking `relation_path` from
/// the rule's root.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RuleParameter {
    pub name: String,
    pub object_type: OoiType,
    pub relation_path: RelationPath,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub min_scan_level: ScanLevel,
}

impl RuleParameter {
    pub fn new(
        name: impl Into<String>,
        object_type: OoiType,
        relation_path: RelationPath,
    ) -> Self {
        Self {
            name: name.into(),
            object_type,
            relation_path,
            optional: false,
            min_scan_level: ScanLevel::L0,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_min_scan_level(mut self, level: ScanLevel) -> Self {
        self.min_scan_level = level;
        self
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: PluginId,
    /// Root type; subtypes match too.
    pub consumes: OoiType,
    #[serde(default)]
    pub parameters: Vec<RuleParameter>,
    pub produces: BTreeSet<OoiType>,
    /// Clearance the root needs before the rule is evaluated.
    #[serde(default)]
    pub min_scan_level: ScanLevel,
    #[serde(default = "default_enabled")]
    pub default_enabled: bool,
    /// Overrides the engine-wide cache TTL.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
    /// Path from the root to the object carrying this rule's `Config`.
    #[serde(default)]
    pub config_path: Option<RelationPath>,
}

impl RuleDefinition {
    pub fn new(
        id: impl Into<PluginId>,
        consumes: OoiType,
        produces: impl IntoIterator<Item = OoiType>,
    ) -> Self {
        Self {
            id: id.into(),
            consumes,
            parameters: Vec::new(),
            produces: produces.into_iter().collect(),
            min_scan_level: ScanLevel::L0,
            default_enabled: true,
            cache_ttl_secs: None,
            config_path: None,
        }
    }

    pub fn with_parameter(mut self, parameter: RuleParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_config_path(mut self, path: RelationPath) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn with_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = Some(secs);
        self
    }

    pub fn with_min_scan_level(mut self, level: ScanLevel) -> Self {
        self.min_scan_level = level;
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.default_enabled = false;
        self
    }

    /// Whether an object of `produced` satisfies the declared outputs.
    pub fn declares_output(&self, produced: OoiType) -> bool {
        self.produces.iter().any(|declared| produced.is_a(*declared))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PluginDefinition {
    Boefje(BoefjeDefinition),
    Normalizer(NormalizerDefinition),
    Rule(RuleDefinition),
}

impl PluginDefinition {
    pub fn id(&self) -> &PluginId {
        match self {
            PluginDefinition::Boefje(def) => &def.id,
            PluginDefinition::Normalizer(def) => &def.id,
            PluginDefinition::Rule(def) => &def.id,
        }
    }

    /// Consumed types or tags as strings, for the routing graph.
    pub fn consumes(&self) -> BTreeSet<String> {
        match self {
            PluginDefinition::Boefje(def) => {
                def.consumes.iter().map(ToString::to_string).collect()
            }
            PluginDefinition::Normalizer(def) => def.consumes.clone(),
            PluginDefinition::Rule(def) => {
                BTreeSet::from([def.consumes.to_string()])
            }
        }
    }

    pub fn produces(&self) -> BTreeSet<String> {
        match self {
            PluginDefinition::Boefje(def) => {
                let mut tags = def.produces.clone();
                tags.insert(boefje_content_tag(&def.id));
                tags
            }
            PluginDefinition::Normalizer(def) => {
                def.produces.iter().map(ToString::to_string).collect()
            }
            PluginDefinition::Rule(def) => {
                def.produces.iter().map(ToString::to_string).collect()
            }
        }
    }
}

impl From<BoefjeDefinition> for PluginDefinition {
    fn from(value: BoefjeDefinition) -> Self {
        PluginDefinition::Boefje(value)
    }
}

impl From<NormalizerDefinition> for PluginDefinition {
    fn from(value: NormalizerDefinition) -> Self {
        PluginDefinition::Normalizer(value)
    }
}

impl From<RuleDefinition> for PluginDefinition {
    fn from(value: RuleDefinition) -> Self {
        PluginDefinition::Rule(value)
    }
}
