use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use kat_core::{config::PipelineConfig, registry::PluginId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::{parse_bool, parse_csv};

/// Source that produced the pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Pipeline tuning plus the location of the plugin manifest.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSettings {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    /// Plugin manifest to load on top of the built-in plugins. Relative
    /// paths resolve against the settings file's directory.
    pub manifest: Option<PathBuf>,
}

impl PipelineSettings {
    /// Load settings using environment variables.
    /// Evaluation order:
    /// 1) `$KAT_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$KAT_CONFIG_JSON` (inline JSON),
    /// 3) `kat.toml` / `kat.json` / `config/kat.toml` / `config/kat.json`,
    /// 4) defaults if none of these exist.
    ///
    /// `$KAT_AUTO_SCHEDULE_BOEFJES`, `$KAT_ORGANIZATION` and
    /// `$KAT_RULES_DISABLED` (comma separated rule ids) override the loaded
    /// values.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        Self::load_with(|key| env::var(key).ok())
    }

    /// [`Self::load_from_env`] over an arbitrary variable lookup.
    pub fn load_with(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<(Self, ConfigSource)> {
        let var =
            |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let (mut settings, source) =
            if let Some(path) = var("KAT_CONFIG_PATH") {
                let path = PathBuf::from(path);
                (Self::load_from_file(&path)?, ConfigSource::EnvPath(path))
            } else if let Some(raw) = var("KAT_CONFIG_JSON") {
                let parsed = Self::parse_json(&raw)
                    .context("failed to parse KAT_CONFIG_JSON")?;
                (parsed, ConfigSource::EnvInline)
            } else if let Some(path) = Self::find_default_file() {
                (Self::load_from_file(&path)?, ConfigSource::File(path))
            } else {
                (Self::default(), ConfigSource::Default)
            };

        if let Some(raw) = var("KAT_AUTO_SCHEDULE_BOEFJES") {
            settings.pipeline.auto_schedule_boefjes =
                parse_bool(&raw).ok_or_else(|| {
                    anyhow!(
                        "KAT_AUTO_SCHEDULE_BOEFJES must be a boolean, got {raw:?}"
                    )
                })?;
        }
        if let Some(organization) = var("KAT_ORGANIZATION") {
            settings.pipeline.organization = organization;
        }
        if let Some(raw) = var("KAT_RULES_DISABLED") {
            settings
                .pipeline
                .derivation
                .rules_disabled
                .extend(parse_csv(&raw).into_iter().map(PluginId::from));
        }

        debug!(source = ?source, "pipeline settings loaded");
        Ok((settings, source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| {
            format!("failed to read pipeline config from {}", path.display())
        })?;

        let extension = path.extension().and_then(|ext| ext.to_str());
        let mut settings = match extension {
            Some("json") => Self::parse_json(&contents).with_context(|| {
                format!("invalid pipeline config {}", path.display())
            })?,
            Some("toml") => toml::from_str(&contents).map_err(|err| {
                anyhow!("invalid pipeline config {}: {}", path.display(), err)
            })?,
            _ => Self::parse_from_str(&contents, &path.display().to_string())?,
        };

        if let Some(manifest) = &settings.manifest
            && manifest.is_relative()
            && let Some(dir) = path.parent()
        {
            settings.manifest = Some(dir.join(manifest));
        }
        Ok(settings)
    }

    pub fn parse_from_str(
        contents: &str,
        origin: &str,
    ) -> anyhow::Result<Self> {
        // TOML first, then JSON.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse pipeline config {origin}: \
                     toml error: {toml_err}; json error: {json_err}"
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| anyhow!("invalid pipeline config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        const CANDIDATES: &[&str] = &[
            "kat.toml",
            "kat.json",
            "config/kat.toml",
            "config/kat.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }
}
