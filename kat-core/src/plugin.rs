//! Compile-time contracts implemented by plugin code.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kat_model::{Downcast, Ooi, OoiType};
use thiserror::Error;

use crate::{
    error::Result,
    job::{BoefjeJob, NormalizerJob, RawResult},
};

/// How a scan attempt went wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The target misbehaved (unreachable, refused, NXDOMAIN). Recorded as
    /// raw output; the pipeline continues.
    #[error("scan failed: {0}")]
    Expected(String),

    /// The runner itself broke. Aborts the job.
    #[error("runner infrastructure failed: {0}")]
    Infrastructure(String),
}

#[async_trait]
pub trait Boefje: Send + Sync {
    async fn scan(
        &self,
        job: &BoefjeJob,
        input: &Ooi,
    ) -> std::result::Result<RawResult, ScanError>;
}

#[async_trait]
pub trait Normalizer: Send + Sync {
    /// Parse raw evidence. Unparseable input is reported as
    /// [`crate::PipelineError::MalformedInput`].
    async fn normalize(
        &self,
        job: &NormalizerJob,
        input: &Ooi,
        raw: &[u8],
    ) -> Result<Vec<Ooi>>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RuleError(pub String);

impl RuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Settings a rule reads from the `Config` object attached to it.
pub type RuleConfig = BTreeMap<String, String>;

/// Objects resolved for one declared parameter. An empty slot is a hole
/// left by an optional parameter with no matches.
#[derive(Clone, Debug, PartialEq)]
pub struct ContextSlot {
    pub parameter: String,
    pub object_type: OoiType,
    pub objects: Vec<Ooi>,
}

/// Resolved context in declared parameter order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleContext {
    pub slots: Vec<ContextSlot>,
}

impl RuleContext {
    pub fn slot(&self, parameter: &str) -> Option<&ContextSlot> {
        self.slots.iter().find(|slot| slot.parameter == parameter)
    }

    pub fn objects(&self, parameter: &str) -> &[Ooi] {
        self.slot(parameter)
            .map(|slot| slot.objects.as_slice())
            .unwrap_or_default()
    }

    /// Concrete structs resolved for `parameter`, skipping other types.
    pub fn objects_of<T: Downcast>(&self, parameter: &str) -> Vec<&T> {
        self.objects(parameter)
            .iter()
            .filter_map(|ooi| ooi.downcast::<T>())
            .collect()
    }
}

/// A pure derivation: no I/O, no hidden state, same input same output.
pub trait Rule: Send + Sync {
    fn evaluate(
        &self,
        root: &Ooi,
        context: &RuleContext,
        config: &RuleConfig,
    ) -> std::result::Result<Vec<Ooi>, RuleError>;
}

/// Closures are rules too.
impl<F> Rule for F
where
    F: Fn(
            &Ooi,
            &RuleContext,
            &RuleConfig,
        ) -> std::result::Result<Vec<Ooi>, RuleError>
        + Send
        + Sync,
{
    fn evaluate(
        &self,
        root: &Ooi,
        context: &RuleContext,
        config: &RuleConfig,
    ) -> std::result::Result<Vec<Ooi>, RuleError> {
        self(root, context, config)
    }
}
