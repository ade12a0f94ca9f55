use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use kat_model::{Ooi, Reference};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::Result, registry::PluginId, store::OoiEvent};

/// Content tag attached to raw output that records an expected scan failure.
pub const BOEFJE_ERROR_TAG: &str = "error/boefje";

/// Unique identifier for pipeline jobs.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One work queue per job kind, each served by its own worker pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Boefje,
    Normalizer,
    Derive,
}

impl JobKind {
    pub fn all_kinds() -> &'static [Self] {
        &[JobKind::Boefje, JobKind::Normalizer, JobKind::Derive]
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Boefje => write!(f, "boefje"),
            JobKind::Normalizer => write!(f, "normalizer"),
            JobKind::Derive => write!(f, "derive"),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Plugin identity plus the version that was scheduled.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PluginRef {
    pub id: PluginId,
    #[serde(default)]
    pub version: Option<String>,
}

impl PluginRef {
    pub fn new(id: impl Into<PluginId>) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }
}

/// Timestamps and outcome shared by every job shape.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobLifecycle {
    pub status: JobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobLifecycle {
    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    /// Completed, but the plugin reported an expected failure.
    pub fn complete_with_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.complete();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }
}

/// One scan of one input object by one Boefje.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoefjeJob {
    pub id: JobId,
    pub boefje: PluginRef,
    pub input_ooi: Reference,
    /// Serialized snapshot of the input object at scheduling time.
    pub input: serde_json::Value,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    pub organization: String,
    #[serde(flatten)]
    pub lifecycle: JobLifecycle,
}

impl BoefjeJob {
    pub fn new(
        boefje: PluginRef,
        input: &Ooi,
        organization: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            id: JobId::new(),
            boefje,
            input_ooi: input.reference(),
            input: serde_json::to_value(input)?,
            arguments: BTreeMap::new(),
            organization: organization.into(),
            lifecycle: JobLifecycle::default(),
        })
    }

    pub fn with_arguments(
        mut self,
        arguments: BTreeMap<String, String>,
    ) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn input_snapshot(&self) -> Result<Ooi> {
        Ok(serde_json::from_value(self.input.clone())?)
    }
}

/// Parsing of one Boefje job's raw output by one Normalizer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NormalizerJob {
    pub id: JobId,
    pub boefje_job: BoefjeJob,
    pub normalizer: PluginRef,
    #[serde(flatten)]
    pub lifecycle: JobLifecycle,
}

impl NormalizerJob {
    pub fn new(boefje_job: BoefjeJob, normalizer: PluginRef) -> Self {
        Self {
            id: JobId::new(),
            boefje_job,
            normalizer,
            lifecycle: JobLifecycle::default(),
        }
    }

    pub fn input_ooi(&self) -> &Reference {
        &self.boefje_job.input_ooi
    }
}

/// A (rule, root) pair already evaluated earlier in a derivation chain.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LineageEntry {
    pub rule: PluginId,
    pub root: Reference,
}

/// Derivation triggered by a committed object.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeriveJob {
    pub id: JobId,
    pub event: OoiEvent,
    /// Number of derivation steps between the originating observation and
    /// this event.
    pub depth: u32,
    #[serde(default)]
    pub lineage: Vec<LineageEntry>,
    #[serde(flatten)]
    pub lifecycle: JobLifecycle,
}

impl DeriveJob {
    pub fn new(event: OoiEvent) -> Self {
        Self {
            id: JobId::new(),
            event,
            depth: 0,
            lineage: Vec::new(),
            lifecycle: JobLifecycle::default(),
        }
    }

    pub fn follow_up(&self, event: OoiEvent, step: LineageEntry) -> Self {
        let mut lineage = self.lineage.clone();
        lineage.push(step);
        Self {
            id: JobId::new(),
            event,
            depth: self.depth + 1,
            lineage,
            lifecycle: JobLifecycle::default(),
        }
    }

    pub fn has_visited(&self, rule: &PluginId, root: &Reference) -> bool {
        self.lineage
            .iter()
            .any(|entry| &entry.rule == rule && &entry.root == root)
    }
}

/// Structured payload per job kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum JobPayload {
    Boefje(BoefjeJob),
    Normalizer(NormalizerJob),
    Derive(DeriveJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Boefje(_) => JobKind::Boefje,
            JobPayload::Normalizer(_) => JobKind::Normalizer,
            JobPayload::Derive(_) => JobKind::Derive,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobPayload::Boefje(job) => job.id,
            JobPayload::Normalizer(job) => job.id,
            JobPayload::Derive(job) => job.id,
        }
    }
}

/// Raw evidence produced by a Boefje run.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub bytes: Vec<u8>,
    pub content_tags: BTreeSet<String>,
}

impl RawResult {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            content_tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.content_tags.insert(tag.into());
        self
    }

    /// Raw output recording an error message instead of evidence.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message.into().into_bytes()).with_tag(BOEFJE_ERROR_TAG)
    }

    pub fn is_error(&self) -> bool {
        self.content_tags.contains(BOEFJE_ERROR_TAG)
    }
}
