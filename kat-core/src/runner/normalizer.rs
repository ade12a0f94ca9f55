use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use kat_model::Ooi;
use tracing::{info, warn};

use crate::{
    error::{PipelineError, Result, panic_message},
    job::NormalizerJob,
    registry::StaticPluginRegistry,
};

#[derive(Debug)]
pub struct NormalizerRunner {
    registry: Arc<StaticPluginRegistry>,
}

impl NormalizerRunner {
    pub fn new(registry: Arc<StaticPluginRegistry>) -> Self {
        Self { registry }
    }

    /// Parse `raw` into objects. The input object itself and undeclared
    /// output types are dropped; malformed input yields nothing.
    pub async fn run(
        &self,
        job: &mut NormalizerJob,
        raw: &[u8],
    ) -> Result<Vec<Ooi>> {
        job.lifecycle.start();

        let Some(registered) = self.registry.normalizer(&job.normalizer.id)
        else {
            let err = PipelineError::NotFound(format!(
                "normalizer {}",
                job.normalizer.id
            ));
            job.lifecycle.fail(err.to_string());
            return Err(err);
        };
        let input = match job.boefje_job.input_snapshot() {
            Ok(input) => input,
            Err(err) => {
                job.lifecycle.fail(err.to_string());
                return Err(err);
            }
        };

        let normalize = registered.body.normalize(job, &input, raw);
        let parsed = AssertUnwindSafe(normalize)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(PipelineError::TransientRunner(format!(
                    "normalizer panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });
        let produced = match parsed {
            Ok(produced) => produced,
            Err(PipelineError::MalformedInput(message)) => {
                warn!(
                    target: "kat::normalizer",
                    normalizer = %job.normalizer.id,
                    job_id = %job.id,
                    error = %message,
                    "malformed raw input, no objects produced"
                );
                job.lifecycle.complete_with_error(message);
                return Ok(Vec::new());
            }
            Err(err) => {
                job.lifecycle.fail(err.to_string());
                return Err(err);
            }
        };

        let input_ref = input.reference();
        let declared = &registered.definition.produces;
        let mut seen = HashSet::new();
        let mut objects = Vec::with_capacity(produced.len());
        for ooi in produced {
            let reference = ooi.reference();
            if reference == input_ref {
                continue;
            }
            let object_type = ooi.object_type();
            if !declared.iter().any(|ty| object_type.is_a(*ty)) {
                warn!(
                    target: "kat::normalizer",
                    normalizer = %job.normalizer.id,
                    object_type = %object_type,
                    "dropping undeclared output type"
                );
                continue;
            }
            if seen.insert(reference) {
                objects.push(ooi);
            }
        }

        job.lifecycle.complete();
        info!(
            target: "kat::normalizer",
            normalizer = %job.normalizer.id,
            job_id = %job.id,
            objects = objects.len(),
            "normalizer finished"
        );
        Ok(objects)
    }
}
