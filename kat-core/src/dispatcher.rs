use std::{any::type_name, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kat_model::{Ooi, Reference};
use tracing::{Instrument, debug, debug_span, info, warn};
use uuid::Uuid;

use crate::{
    artifacts::{ArtifactStore, DerivationAttempt},
    clearance::apply_implied_profiles,
    config::PipelineConfig,
    derive::{DerivationEngine, RuleStatus},
    error::{PipelineError, Result},
    events::{
        PipelineEvent, PipelineEventPayload, PipelineEventPublisher,
        RuleEvaluation,
    },
    job::{
        BoefjeJob, DeriveJob, JobPayload, LineageEntry, NormalizerJob,
        PluginRef, RawResult,
    },
    queue::{EnqueueRequest, JobHandle, QueueService, QueuedJob},
    registry::{PluginId, StaticPluginRegistry},
    runner::{BoefjeRunner, NormalizerRunner},
    store::{GraphStore, Observation, OoiEvent},
};

/// Outcome of dispatcher execution for a single job. Failures are final:
/// nothing is retried automatically.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    Failed { error: String },
}

impl DispatchStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchStatus::Success)
    }
}

/// Primary contract exposed to worker loops for executing dequeued jobs.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &QueuedJob) -> DispatchStatus;
}

/// Collaborators the dispatcher routes work through.
#[derive(Clone)]
pub struct DispatcherServices {
    pub store: Arc<dyn GraphStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub registry: Arc<StaticPluginRegistry>,
    pub engine: Arc<DerivationEngine>,
    pub boefje_runner: Arc<BoefjeRunner>,
    pub normalizer_runner: Arc<NormalizerRunner>,
}

impl fmt::Debug for DispatcherServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherServices")
            .field("store", &"GraphStore")
            .field("artifacts", &"ArtifactStore")
            .field("registry", &self.registry)
            .field("engine", &self.engine)
            .field("boefje_runner", &self.boefje_runner)
            .field("normalizer_runner", &self.normalizer_runner)
            .finish()
    }
}

pub struct DefaultJobDispatcher<Q, E>
where
    Q: QueueService + Send + Sync + 'static,
    E: PipelineEventPublisher + Send + Sync + 'static,
{
    queue: Arc<Q>,
    events: Arc<E>,
    services: DispatcherServices,
    config: PipelineConfig,
}

impl<Q, E> fmt::Debug for DefaultJobDispatcher<Q, E>
where
    Q: QueueService + Send + Sync + 'static,
    E: PipelineEventPublisher + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultJobDispatcher")
            .field("queue", &type_name::<Q>())
            .field("events", &type_name::<E>())
            .field("services", &self.services)
            .field("config", &self.config)
            .finish()
    }
}

impl<Q, E> DefaultJobDispatcher<Q, E>
where
    Q: QueueService + Send + Sync + 'static,
    E: PipelineEventPublisher + Send + Sync + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        events: Arc<E>,
        services: DispatcherServices,
        config: PipelineConfig,
    ) -> Self {
        Self {
            queue,
            events,
            services,
            config,
        }
    }

    pub fn services(&self) -> &DispatcherServices {
        &self.services
    }

    fn handle_pipeline_error(&self, err: PipelineError) -> DispatchStatus {
        let msg = err.to_string();
        match err {
            PipelineError::TransientRunner(_) => {
                warn!(
                    target: "kat::dispatch",
                    error = %msg,
                    "job failed due to runner infrastructure error"
                );
            }
            PipelineError::Store(_) | PipelineError::ContextResolution(_) => {
                warn!(
                    target: "kat::dispatch",
                    error = %msg,
                    "job failed due to unreachable graph store"
                );
            }
            PipelineError::NotFound(_) => {
                warn!(
                    target: "kat::dispatch",
                    error = %msg,
                    "job failed due to missing input"
                );
            }
            _ => {
                warn!(target: "kat::dispatch", error = %msg, "job failed");
            }
        }
        DispatchStatus::Failed { error: msg }
    }

    async fn publish(
        &self,
        correlation_id: Option<Uuid>,
        payload: PipelineEventPayload,
    ) {
        if let Err(err) = self
            .events
            .publish(PipelineEvent::new(correlation_id, payload))
            .await
        {
            debug!(
                target: "kat::dispatch",
                error = %err,
                "event publish failed"
            );
        }
    }

    async fn enqueue_follow_up_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobHandle>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let correlations: Vec<_> =
            requests.iter().map(|request| request.correlation_id).collect();
        let handles = self.queue.enqueue_many(requests).await?;
        for (handle, correlation_id) in handles.iter().zip(correlations) {
            self.publish(
                correlation_id,
                PipelineEventPayload::JobEnqueued {
                    job_id: handle.job_id,
                    kind: handle.kind,
                },
            )
            .await;
        }
        Ok(handles)
    }

    /// Validate and enqueue a scan of `input` by `boefje`. The input type must
    /// be consumed by the Boefje and its clearance must cover the Boefje's
    /// scan level.
    pub async fn schedule_boefje(
        &self,
        boefje: &PluginId,
        input: &Reference,
        correlation_id: Option<Uuid>,
    ) -> Result<JobHandle> {
        let registered = self
            .services
            .registry
            .boefje(boefje)
            .ok_or_else(|| {
                PipelineError::NotFound(format!("boefje {boefje}"))
            })?;
        let ooi = self
            .services
            .store
            .get(input, Utc::now())
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("object {input}")))?;

        let def = &registered.definition;
        let object_type = ooi.object_type();
        if !def.consumes.iter().any(|consumed| object_type.is_a(*consumed)) {
            return Err(PipelineError::SchemaViolation(format!(
                "boefje {boefje} does not consume {object_type}"
            )));
        }
        if ooi.scan_level() < def.scan_level {
            return Err(PipelineError::InsufficientClearance {
                required: def.scan_level,
                actual: ooi.scan_level(),
            });
        }

        let job = BoefjeJob::new(
            PluginRef {
                id: def.id.clone(),
                version: def.version.clone(),
            },
            &ooi,
            self.config.organization.clone(),
        )?;
        let request = EnqueueRequest::new(JobPayload::Boefje(job))
            .with_correlation(correlation_id);
        let mut handles = self.enqueue_follow_up_many(vec![request]).await?;
        handles
            .pop()
            .ok_or_else(|| {
                PipelineError::Internal("queue returned no handle".into())
            })
    }

    /// Boefje jobs for committed objects, when auto-scheduling is on.
    pub(crate) async fn boefje_follow_ups(
        &self,
        events: &[OoiEvent],
        correlation_id: Option<Uuid>,
    ) -> Vec<EnqueueRequest> {
        if !self.config.auto_schedule_boefjes {
            return Vec::new();
        }
        let mut requests = Vec::new();
        for event in events {
            let found = self
                .services
                .store
                .get(&event.reference, event.valid_time)
                .await;
            let ooi = match found {
                Ok(Some(ooi)) => ooi,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        target: "kat::dispatch",
                        reference = %event.reference,
                        error = %err,
                        "skipping boefje scheduling"
                    );
                    continue;
                }
            };
            for boefje in self
                .services
                .registry
                .boefjes_for(ooi.object_type(), ooi.scan_level())
            {
                let plugin = PluginRef {
                    id: boefje.definition.id.clone(),
                    version: boefje.definition.version.clone(),
                };
                let organization = self.config.organization.clone();
                match BoefjeJob::new(plugin, &ooi, organization) {
                    Ok(job) => requests.push(
                        EnqueueRequest::new(JobPayload::Boefje(job))
                            .with_correlation(correlation_id),
                    ),
                    Err(err) => {
                        warn!(
                            target: "kat::dispatch",
                            error = %err,
                            "could not build boefje job"
                        );
                    }
                }
            }
        }
        requests
    }

    async fn handle_boefje(
        &self,
        queued: &QueuedJob,
        job: &BoefjeJob,
    ) -> DispatchStatus {
        let mut job = job.clone();

        let raw = match self.services.boefje_runner.run(&mut job).await {
            Ok(raw) => raw,
            Err(err) => {
                let raw = RawResult::error(err.to_string());
                if let Err(persist) = self.persist_boefje(&job, &raw).await {
                    warn!(
                        target: "kat::dispatch",
                        error = %persist,
                        "could not persist failed boefje job"
                    );
                }
                return self.handle_pipeline_error(err);
            }
        };

        if let Err(err) = self.persist_boefje(&job, &raw).await {
            return self.handle_pipeline_error(err);
        }

        let normalizers = self
            .services
            .registry
            .normalizers_for(&raw.content_tags, &job.boefje.id);
        debug!(
            target: "kat::dispatch",
            boefje = %job.boefje.id,
            tags = ?raw.content_tags,
            normalizers = normalizers.len(),
            "routing raw output"
        );

        let requests = normalizers
            .into_iter()
            .map(|normalizer| {
                let normalizer_job = NormalizerJob::new(
                    job.clone(),
                    PluginRef::new(normalizer.definition.id.clone()),
                );
                EnqueueRequest::new(JobPayload::Normalizer(normalizer_job))
                    .with_correlation(queued.correlation_id)
            })
            .collect();

        match self.enqueue_follow_up_many(requests).await {
            Ok(_) => DispatchStatus::Success,
            Err(err) => self.handle_pipeline_error(err),
        }
    }

    async fn persist_boefje(
        &self,
        job: &BoefjeJob,
        raw: &RawResult,
    ) -> Result<()> {
        self.services.artifacts.save_boefje_job(job).await?;
        self.services.artifacts.save_raw(job.id, raw).await
    }

    async fn handle_normalizer(
        &self,
        queued: &QueuedJob,
        job: &NormalizerJob,
    ) -> DispatchStatus {
        let mut job = job.clone();
        let result = self.run_normalizer(queued, &mut job).await;
        if let Err(err) = &result {
            job.lifecycle.fail(err.to_string());
        }
        if let Err(err) =
            self.services.artifacts.save_normalizer_job(&job).await
        {
            warn!(
                target: "kat::dispatch",
                error = %err,
                "could not persist normalizer job"
            );
        }
        match result {
            Ok(()) => DispatchStatus::Success,
            Err(err) => self.handle_pipeline_error(err),
        }
    }

    async fn run_normalizer(
        &self,
        queued: &QueuedJob,
        job: &mut NormalizerJob,
    ) -> Result<()> {
        let raw = self
            .services
            .artifacts
            .raw(job.boefje_job.id)
            .await?
            .ok_or_else(|| {
                PipelineError::NotFound(format!(
                    "raw output of {}",
                    job.boefje_job.id
                ))
            })?;

        let valid_time =
            job.boefje_job.lifecycle.ended_at.unwrap_or_else(Utc::now);
        let source = job.input_ooi().clone();
        let input = self
            .services
            .store
            .get(&source, valid_time)
            .await?
            .ok_or_else(|| {
                PipelineError::NotFound(format!("input object {source}"))
            })?;

        let mut objects =
            self.services.normalizer_runner.run(job, &raw.bytes).await?;
        apply_implied_profiles(&input, &mut objects);

        let events = self
            .services
            .store
            .save_observation(Observation {
                method: job.normalizer.id.to_string(),
                source,
                task_id: Some(job.id),
                valid_time,
                result: objects,
            })
            .await?;

        info!(
            target: "kat::dispatch",
            normalizer = %job.normalizer.id,
            committed = events.len(),
            "normalizer output committed"
        );
        self.commit_follow_ups(queued, job.id, None, events).await
    }

    /// Derive jobs (and optionally Boefje jobs) for newly committed objects.
    async fn commit_follow_ups(
        &self,
        queued: &QueuedJob,
        job_id: crate::job::JobId,
        parent: Option<(&DeriveJob, LineageEntry)>,
        events: Vec<OoiEvent>,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.publish(
            queued.correlation_id,
            PipelineEventPayload::ObjectsCommitted {
                job_id,
                events: events.clone(),
            },
        )
        .await;

        let mut requests =
            self.boefje_follow_ups(&events, queued.correlation_id).await;
        requests.extend(events.into_iter().map(|event| {
            let derive = match &parent {
                Some((job, step)) => job.follow_up(event, step.clone()),
                None => DeriveJob::new(event),
            };
            EnqueueRequest::new(JobPayload::Derive(derive))
                .with_correlation(queued.correlation_id)
        }));
        self.enqueue_follow_up_many(requests).await.map(|_| ())
    }

    async fn handle_derive(
        &self,
        queued: &QueuedJob,
        job: &DeriveJob,
    ) -> DispatchStatus {
        let mut job = job.clone();
        job.lifecycle.start();
        let result = self.run_derive(queued, &job).await;
        match &result {
            Ok(()) => job.lifecycle.complete(),
            Err(err) => job.lifecycle.fail(err.to_string()),
        }
        if let Err(err) = self.services.artifacts.save_derive_job(&job).await {
            warn!(
                target: "kat::dispatch",
                error = %err,
                "could not persist derive job"
            );
        }
        match result {
            Ok(()) => DispatchStatus::Success,
            Err(err) => self.handle_pipeline_error(err),
        }
    }

    /// Evaluate everything `job.event` triggers. Each (rule, root) attempt
    /// is recorded once its output is committed, or with the commit error.
    async fn run_derive(
        &self,
        queued: &QueuedJob,
        job: &DeriveJob,
    ) -> Result<()> {
        let valid_time = job.event.valid_time;
        let outcomes = self
            .services
            .engine
            .derive_for_event(&job.event, valid_time)
            .await?;

        for outcome in outcomes {
            let root = outcome.root.reference();
            let mut evaluation = outcome.evaluation();
            let mut output: Vec<Reference> =
                outcome.objects().iter().map(Ooi::reference).collect();

            if let RuleStatus::Derived { objects, .. } = outcome.status {
                if job.has_visited(&outcome.rule, &root) {
                    warn!(
                        target: "kat::derive",
                        rule = %outcome.rule,
                        root = %root,
                        depth = job.depth,
                        "derivation cycle detected, output discarded"
                    );
                } else if let Err(err) = self
                    .commit_derived(
                        queued,
                        job,
                        &outcome.rule,
                        &outcome.root,
                        objects,
                        valid_time,
                    )
                    .await
                {
                    warn!(
                        target: "kat::derive",
                        rule = %outcome.rule,
                        root = %root,
                        error = %err,
                        "could not commit derived objects"
                    );
                    evaluation = RuleEvaluation::Failed {
                        error: err.to_string(),
                    };
                    output.clear();
                }
            }

            let attempt = DerivationAttempt::new(
                Some(job.id),
                outcome.rule.clone(),
                root.clone(),
                evaluation.clone(),
            )
            .with_output(output);
            if let Err(err) =
                self.services.artifacts.save_derivation_attempt(attempt).await
            {
                warn!(
                    target: "kat::dispatch",
                    error = %err,
                    "could not persist derivation attempt"
                );
            }
            self.publish(
                queued.correlation_id,
                PipelineEventPayload::RuleEvaluated {
                    rule: outcome.rule,
                    root,
                    evaluation,
                },
            )
            .await;
        }
        Ok(())
    }

    async fn commit_derived(
        &self,
        queued: &QueuedJob,
        job: &DeriveJob,
        rule: &PluginId,
        root: &Ooi,
        mut objects: Vec<Ooi>,
        valid_time: DateTime<Utc>,
    ) -> Result<()> {
        apply_implied_profiles(root, &mut objects);
        let events = self
            .services
            .store
            .save_observation(Observation {
                method: rule.to_string(),
                source: root.reference(),
                task_id: Some(job.id),
                valid_time,
                result: objects,
            })
            .await?;

        if job.depth + 1 > self.config.derivation.max_depth {
            if !events.is_empty() {
                warn!(
                    target: "kat::derive",
                    rule = %rule,
                    depth = job.depth,
                    max_depth = self.config.derivation.max_depth,
                    "derivation depth limit reached, not re-triggering"
                );
            }
            return Ok(());
        }

        let step = LineageEntry {
            rule: rule.clone(),
            root: root.reference(),
        };
        self.commit_follow_ups(queued, job.id, Some((job, step)), events)
            .await
    }
}

#[async_trait]
impl<Q, E> JobDispatcher for DefaultJobDispatcher<Q, E>
where
    Q: QueueService + Send + Sync + 'static,
    E: PipelineEventPublisher + Send + Sync + 'static,
{
    async fn dispatch(&self, job: &QueuedJob) -> DispatchStatus {
        let span = debug_span!(
            "dispatch",
            job_id = %job.job_id(),
            kind = %job.kind()
        );
        async {
            match &job.payload {
                JobPayload::Boefje(payload) => {
                    self.handle_boefje(job, payload).await
                }
                JobPayload::Normalizer(payload) => {
                    self.handle_normalizer(job, payload).await
                }
                JobPayload::Derive(payload) => {
                    self.handle_derive(job, payload).await
                }
            }
        }
        .instrument(span)
        .await
    }
}
