use chrono::{DateTime, Utc};
use kat_model::{Config, Ooi};

use crate::{
    clearance::clamp_to_path,
    error::{PipelineError, Result},
    plugin::{ContextSlot, RuleConfig, RuleContext},
    registry::RuleDefinition,
    store::{GraphStore, StoreError},
};

/// Context for one evaluation, or the first mandatory parameter that
/// resolved to nothing.
#[derive(Debug)]
pub(crate) enum Resolution {
    Ready(RuleContext),
    Missing(String),
}

fn resolution_error(what: &str, err: StoreError) -> PipelineError {
    PipelineError::ContextResolution(format!("{what}: {err}"))
}

/// Walk every parameter path from `root`. Candidates are clamped to the
/// lowest bound on their path before the parameter's minimum level is
/// applied; slots keep declared order and hold objects sorted by reference.
pub(crate) async fn resolve_context(
    store: &dyn GraphStore,
    rule: &RuleDefinition,
    root: &Ooi,
    valid_time: DateTime<Utc>,
) -> Result<Resolution> {
    let root_ref = root.reference();
    let mut slots = Vec::with_capacity(rule.parameters.len());

    for param in &rule.parameters {
        let mut objects = store
            .get_along_relation_path(
                &root_ref,
                &param.relation_path,
                param.object_type,
                valid_time,
            )
            .await
            .map_err(|err| resolution_error(&param.name, err))?;

        for ooi in &mut objects {
            clamp_to_path(ooi, &param.relation_path);
        }
        objects.retain(|ooi| ooi.scan_level() >= param.min_scan_level);
        objects.sort_by_key(Ooi::reference);

        if objects.is_empty() && !param.optional {
            return Ok(Resolution::Missing(param.name.clone()));
        }

        slots.push(ContextSlot {
            parameter: param.name.clone(),
            object_type: param.object_type,
            objects,
        });
    }

    Ok(Resolution::Ready(RuleContext { slots }))
}

/// Settings from the `Config` objects attached for this rule to whatever
/// `config_path` reaches. Later holders override earlier keys.
pub(crate) async fn load_rule_config(
    store: &dyn GraphStore,
    rule: &RuleDefinition,
    root: &Ooi,
    valid_time: DateTime<Utc>,
) -> Result<RuleConfig> {
    let mut config = RuleConfig::new();
    let Some(path) = &rule.config_path else {
        return Ok(config);
    };

    let holders = store
        .get_along_relation_path(
            &root.reference(),
            path,
            path.end_type(),
            valid_time,
        )
        .await
        .map_err(|err| resolution_error("config", err))?;

    for holder in holders {
        let reference =
            Config::reference_for(&holder.reference(), rule.id.as_str());
        let found = store
            .get(&reference, valid_time)
            .await
            .map_err(|err| resolution_error("config", err))?;
        if let Some(attached) =
            found.as_ref().and_then(|ooi| ooi.downcast::<Config>())
        {
            config.extend(attached.config.clone());
        }
    }

    Ok(config)
}
