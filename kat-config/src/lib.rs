//! Configuration loading for the KAT pipeline.
//!
//! Settings come from `$KAT_CONFIG_PATH`, `$KAT_CONFIG_JSON`, a default
//! `kat.toml` or the built-in defaults; plugin manifests declare which
//! plugins a deployment runs and bind them to compiled entrypoints.
#![allow(missing_docs)]

pub mod manifest;
pub mod settings;
pub mod util;

use anyhow::Context;
use kat_core::{
    builtin,
    registry::{RegistryBuilder, StaticPluginRegistry},
};

pub use manifest::{PluginEntry, PluginManifest};
pub use settings::{ConfigSource, PipelineSettings};

/// Registry for `settings`: the built-in plugins plus whatever the
/// configured manifest declares against the built-in entrypoints.
pub fn load_registry(
    settings: &PipelineSettings,
) -> anyhow::Result<StaticPluginRegistry> {
    let builder: RegistryBuilder =
        builtin::register(StaticPluginRegistry::builder())
            .context("built-in plugins rejected")?;
    let builder = match &settings.manifest {
        Some(path) => PluginManifest::load_from_file(path)?
            .register(builder, &builtin::entrypoints()),
        None => builder,
    };
    builder.build().context("plugin registry rejected")
}
