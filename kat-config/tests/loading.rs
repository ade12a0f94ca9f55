use std::{fs, path::PathBuf};

use kat_config::{ConfigSource, PipelineSettings, PluginManifest, load_registry};
use kat_core::{
    builtin,
    registry::{PluginId, PluginRegistry},
};
use kat_model::OoiType;
use tempfile::TempDir;

const MANIFEST: &str = r#"
[[plugins]]
kind = "rule"
id = "resolve-again"
consumes = "Hostname"
produces = ["ResolvedHostname"]
entrypoint = "dns-resolving"
cache_ttl_secs = 60

[[plugins.parameters]]
name = "a_records"
object_type = "DNSARecord"
relation_path = "Hostname.<hostname[is DNSARecord]"
optional = true

[[plugins]]
kind = "boefje"
id = "external-scanner"
consumes = ["IPAddressV4"]
scan_level = 2
"#;

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(&path, contents).expect("write file");
    path
}

#[test]
fn settings_file_resolves_manifest_relative_to_itself() {
    let dir = TempDir::new().expect("tempdir");
    write(&dir, "plugins/extra.toml", MANIFEST);
    let config = write(
        &dir,
        "kat.toml",
        r#"
organization = "acme"
manifest = "plugins/extra.toml"

[derivation]
max_depth = 4
"#,
    );

    let settings =
        PipelineSettings::load_from_file(&config).expect("settings load");
    assert_eq!(settings.pipeline.organization, "acme");
    assert_eq!(settings.pipeline.derivation.max_depth, 4);
    assert_eq!(
        settings.manifest.as_deref(),
        Some(dir.path().join("plugins/extra.toml").as_path())
    );
}

#[test]
fn env_path_wins_over_inline_json() {
    let dir = TempDir::new().expect("tempdir");
    let config =
        write(&dir, "pipeline.json", r#"{"organization": "from-file"}"#);
    let config_str = config.display().to_string();

    let (settings, source) = PipelineSettings::load_with(|key| match key {
        "KAT_CONFIG_PATH" => Some(config_str.clone()),
        "KAT_CONFIG_JSON" => Some(r#"{"organization": "inline"}"#.to_string()),
        "KAT_ORGANIZATION" => Some("override".to_string()),
        _ => None,
    })
    .expect("settings load");

    assert_eq!(source, ConfigSource::EnvPath(config));
    assert_eq!(settings.pipeline.organization, "override");
}

#[test]
fn missing_env_path_is_an_error() {
    let err = PipelineSettings::load_with(|key| {
        (key == "KAT_CONFIG_PATH")
            .then(|| "/definitely/not/here/kat.toml".to_string())
    })
    .expect_err("missing file");
    assert!(err.to_string().contains("failed to read pipeline config"));
}

#[test]
fn manifest_binds_declarations_to_builtin_entrypoints() {
    let manifest = PluginManifest::parse_from_str(MANIFEST, "inline")
        .expect("manifest parses");
    assert_eq!(manifest.plugins.len(), 2);

    let registry = manifest
        .build_registry(&builtin::entrypoints())
        .expect("registry builds");
    let rule = registry
        .rule(&PluginId::from("resolve-again"))
        .expect("rule registered");
    assert_eq!(rule.definition.cache_ttl_secs, Some(60));
    assert_eq!(registry.rules_for_root(OoiType::Hostname).len(), 1);

    let boefje = registry
        .boefje(&PluginId::from("external-scanner"))
        .expect("boefje registered");
    assert!(boefje.body.is_none());
}

#[test]
fn unknown_entrypoints_are_rejected() {
    let manifest = PluginManifest::parse_from_str(
        r#"{"plugins": [{
            "kind": "rule",
            "id": "mystery",
            "consumes": "Hostname",
            "produces": ["Finding"],
            "entrypoint": "does-not-exist"
        }]}"#,
        "inline",
    )
    .expect("manifest parses");

    let err = manifest
        .build_registry(&builtin::entrypoints())
        .expect_err("unknown entrypoint");
    assert!(format!("{err:#}").contains("unknown entrypoint"));
}

#[test]
fn load_registry_adds_manifest_to_builtins() {
    let dir = TempDir::new().expect("tempdir");
    let manifest = write(&dir, "extra.toml", MANIFEST);
    let settings = PipelineSettings {
        manifest: Some(manifest),
        ..PipelineSettings::default()
    };

    let registry = load_registry(&settings).expect("registry builds");
    assert!(registry.rule(&PluginId::from(builtin::DNS_RESOLVING)).is_some());
    assert!(registry.rule(&PluginId::from("resolve-again")).is_some());
    assert_eq!(registry.rules_for_root(OoiType::Hostname).len(), 3);
    assert!(registry.resolve(&PluginId::from("external-scanner")).is_ok());
}

#[test]
fn manifest_ids_may_not_shadow_builtins() {
    let dir = TempDir::new().expect("tempdir");
    let manifest = write(
        &dir,
        "dup.toml",
        r#"
[[plugins]]
kind = "rule"
id = "dns-resolving"
consumes = "Hostname"
produces = ["ResolvedHostname"]
entrypoint = "dns-resolving"
"#,
    );
    let settings = PipelineSettings {
        manifest: Some(manifest),
        ..PipelineSettings::default()
    };

    let err = load_registry(&settings).expect_err("duplicate id");
    assert!(format!("{err:#}").contains("duplicate plugin id"));
}
