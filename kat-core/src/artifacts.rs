//! Persisted job metadata, raw evidence and derivation attempts. Every
//! failure stays inspectable after the fact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kat_model::Reference;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::Result,
    events::RuleEvaluation,
    job::{BoefjeJob, DeriveJob, JobId, NormalizerJob, RawResult},
    registry::PluginId,
};

/// One (rule, root) evaluation, recorded whatever its outcome.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DerivationAttempt {
    pub id: Uuid,
    /// Derive job that ran the attempt, if it came from the queue.
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub rule: PluginId,
    pub root: Reference,
    pub evaluation: RuleEvaluation,
    #[serde(default)]
    pub output: Vec<Reference>,
    pub attempted_at: DateTime<Utc>,
}

impl DerivationAttempt {
    pub fn new(
        job_id: Option<JobId>,
        rule: PluginId,
        root: Reference,
        evaluation: RuleEvaluation,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            rule,
            root,
            evaluation,
            output: Vec::new(),
            attempted_at: Utc::now(),
        }
    }

    pub fn with_output(mut self, output: Vec<Reference>) -> Self {
        self.output = output;
        self
    }

    pub fn failed(&self) -> bool {
        matches!(self.evaluation, RuleEvaluation::Failed { .. })
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save_boefje_job(&self, job: &BoefjeJob) -> Result<()>;

    async fn boefje_job(&self, id: JobId) -> Result<Option<BoefjeJob>>;

    async fn save_raw(&self, boefje_job: JobId, raw: &RawResult) -> Result<()>;

    async fn raw(&self, boefje_job: JobId) -> Result<Option<RawResult>>;

    async fn save_normalizer_job(&self, job: &NormalizerJob) -> Result<()>;

    async fn normalizer_job(&self, id: JobId) -> Result<Option<NormalizerJob>>;

    async fn save_derive_job(&self, job: &DeriveJob) -> Result<()>;

    async fn derive_job(&self, id: JobId) -> Result<Option<DeriveJob>>;

    async fn save_derivation_attempt(
        &self,
        attempt: DerivationAttempt,
    ) -> Result<()>;

    /// Attempts in recording order, optionally for a single rule.
    async fn derivation_attempts(
        &self,
        rule: Option<&PluginId>,
    ) -> Result<Vec<DerivationAttempt>>;
}

#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    boefje_jobs: DashMap<JobId, BoefjeJob>,
    raw: DashMap<JobId, RawResult>,
    normalizer_jobs: DashMap<JobId, NormalizerJob>,
    derive_jobs: DashMap<JobId, DeriveJob>,
    attempts: DashMap<Uuid, DerivationAttempt>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boefje_jobs(&self) -> Vec<BoefjeJob> {
        let mut jobs: Vec<_> = self
            .boefje_jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn normalizer_jobs(&self) -> Vec<NormalizerJob> {
        let mut jobs: Vec<_> = self
            .normalizer_jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn derive_jobs(&self) -> Vec<DeriveJob> {
        let mut jobs: Vec<_> = self
            .derive_jobs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save_boefje_job(&self, job: &BoefjeJob) -> Result<()> {
        self.boefje_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn boefje_job(&self, id: JobId) -> Result<Option<BoefjeJob>> {
        Ok(self.boefje_jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn save_raw(&self, boefje_job: JobId, raw: &RawResult) -> Result<()> {
        self.raw.insert(boefje_job, raw.clone());
        Ok(())
    }

    async fn raw(&self, boefje_job: JobId) -> Result<Option<RawResult>> {
        Ok(self.raw.get(&boefje_job).map(|entry| entry.value().clone()))
    }

    async fn save_normalizer_job(&self, job: &NormalizerJob) -> Result<()> {
        self.normalizer_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn normalizer_job(&self, id: JobId) -> Result<Option<NormalizerJob>> {
        Ok(self
            .normalizer_jobs
            .get(&id)
            .map(|entry| entry.value().clone()))
    }

    async fn save_derive_job(&self, job: &DeriveJob) -> Result<()> {
        self.derive_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn derive_job(&self, id: JobId) -> Result<Option<DeriveJob>> {
        Ok(self.derive_jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn save_derivation_attempt(
        &self,
        attempt: DerivationAttempt,
    ) -> Result<()> {
        self.attempts.insert(attempt.id, attempt);
        Ok(())
    }

    async fn derivation_attempts(
        &self,
        rule: Option<&PluginId>,
    ) -> Result<Vec<DerivationAttempt>> {
        let mut attempts: Vec<_> = self
            .attempts
            .iter()
            .filter(|entry| rule.is_none_or(|rule| &entry.value().rule == rule))
            .map(|entry| entry.value().clone())
            .collect();
        attempts.sort_by_key(|attempt| attempt.id);
        Ok(attempts)
    }
}
