use std::{fs, path::Path};

use anyhow::{Context, anyhow};
use kat_core::registry::{
    EntrypointTable, PluginDefinition, RegistryBuilder, StaticPluginRegistry,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One declared plugin and the name of its compiled implementation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PluginEntry {
    #[serde(flatten)]
    pub definition: PluginDefinition,
    /// Name in the entrypoint table. Boefjes without one run through an
    /// external backend.
    #[serde(default)]
    pub entrypoint: Option<String>,
}

/// Static plugin declarations loaded from TOML or JSON:
///
/// ```toml
/// [[plugins]]
/// kind = "rule"
/// id = "dns-resolving"
/// consumes = "Hostname"
/// produces = ["ResolvedHostname"]
/// entrypoint = "dns-resolving"
///
/// [[plugins.parameters]]
/// name = "a_records"
/// object_type = "DNSARecord"
/// relation_path = "Hostname.<hostname[is DNSARecord]"
/// optional = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl PluginManifest {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read plugin manifest from {}", path.display())
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::from_str(&contents).with_context(|| {
                    format!("invalid plugin manifest {}", path.display())
                })
            }
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(
        contents: &str,
        origin: &str,
    ) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse plugin manifest {origin}: \
                     toml error: {toml_err}; json error: {json_err}"
                )
            })
        })
    }

    /// Add every declaration to `builder`, resolving entrypoints in `table`.
    pub fn register(
        &self,
        builder: RegistryBuilder,
        table: &EntrypointTable,
    ) -> RegistryBuilder {
        self.plugins.iter().fold(builder, |builder, entry| {
            builder.with_entrypoint(
                entry.definition.clone(),
                entry.entrypoint.as_deref(),
                table,
            )
        })
    }

    /// Validated registry holding exactly the declared plugins.
    pub fn build_registry(
        &self,
        table: &EntrypointTable,
    ) -> anyhow::Result<StaticPluginRegistry> {
        let registry = self
            .register(StaticPluginRegistry::builder(), table)
            .build()
            .context("plugin manifest rejected")?;
        info!(
            plugins = self.plugins.len(),
            "plugin registry loaded from manifest"
        );
        Ok(registry)
    }
}
