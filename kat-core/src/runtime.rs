//! Single-process runtime: one worker pool per job kind, wired to the
//! dispatcher, plus an inline `drain` mode that runs queued work to
//! completion on the calling task.

use std::{
    any::type_name, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use kat_model::{Ooi, Reference};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    artifacts::{ArtifactStore, InMemoryArtifactStore},
    config::PipelineConfig,
    derive::{DerivationCache, DerivationEngine},
    dispatcher::{
        DefaultJobDispatcher, DispatchStatus, DispatcherServices, JobDispatcher,
    },
    error::{PipelineError, Result, panic_message},
    events::{
        InProcEventBus, PipelineEvent, PipelineEventPayload,
        PipelineEventPublisher,
    },
    job::{DeriveJob, JobKind, JobPayload},
    queue::{EnqueueRequest, InMemoryQueue, JobHandle, QueueService, QueuedJob},
    registry::{PluginId, StaticPluginRegistry},
    runner::{BoefjeBackend, BoefjeRunner, NormalizerRunner},
    store::{GraphStore, InMemoryGraphStore, Observation},
};

/// Counts of jobs settled by one [`PipelineRuntime::drain`] call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
}

impl DrainSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

pub struct PipelineRuntime<Q, E>
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    config: PipelineConfig,
    queue: Arc<Q>,
    events: Arc<E>,
    dispatcher: Arc<DefaultJobDispatcher<Q, E>>,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<Q, E> fmt::Debug for PipelineRuntime<Q, E>
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .ok();
        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("queue", &type_name::<Q>())
            .field("events", &type_name::<E>())
            .field("workers", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl PipelineRuntime<InMemoryQueue, InProcEventBus> {
    /// Runtime over in-memory queue, event bus and artifact store.
    pub fn in_memory(
        config: PipelineConfig,
        registry: Arc<StaticPluginRegistry>,
        store: Arc<dyn GraphStore>,
    ) -> Result<Self> {
        let events = Arc::new(InProcEventBus::new(config.event_capacity));
        PipelineRuntimeBuilder::new(config)
            .with_registry(registry)
            .with_store(store)
            .with_queue(Arc::new(InMemoryQueue::new()))
            .with_events(events)
            .build()
    }
}

impl<Q, E> PipelineRuntime<Q, E>
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<Q> {
        Arc::clone(&self.queue)
    }

    pub fn events(&self) -> Arc<E> {
        Arc::clone(&self.events)
    }

    pub fn dispatcher(&self) -> Arc<DefaultJobDispatcher<Q, E>> {
        Arc::clone(&self.dispatcher)
    }

    pub fn store(&self) -> Arc<dyn GraphStore> {
        Arc::clone(&self.dispatcher.services().store)
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        Arc::clone(&self.dispatcher.services().artifacts)
    }

    pub fn registry(&self) -> Arc<StaticPluginRegistry> {
        Arc::clone(&self.dispatcher.services().registry)
    }

    pub fn engine(&self) -> Arc<DerivationEngine> {
        Arc::clone(&self.dispatcher.services().engine)
    }

    pub fn cache(&self) -> DerivationCache {
        self.dispatcher.services().engine.cache().clone()
    }

    /// Schedule a scan of `input` by `boefje`, subject to the consumes and
    /// clearance gate. Starts a new correlation chain.
    pub async fn submit_boefje(
        &self,
        boefje: &PluginId,
        input: &Reference,
    ) -> Result<JobHandle> {
        let handle = self
            .dispatcher
            .schedule_boefje(boefje, input, Some(Uuid::now_v7()))
            .await?;
        info!(
            target: "kat::runtime",
            boefje = %boefje,
            input = %input,
            job_id = %handle.job_id,
            "boefje job submitted"
        );
        Ok(handle)
    }

    /// Commit objects declared outside any plugin run and enqueue derivation
    /// (and, when enabled, scans) for whatever changed.
    pub async fn submit_observation(
        &self,
        method: impl Into<String>,
        source: &Ooi,
        objects: Vec<Ooi>,
        valid_time: DateTime<Utc>,
    ) -> Result<Vec<JobHandle>> {
        let events = self
            .store()
            .save_observation(Observation {
                method: method.into(),
                source: source.reference(),
                task_id: None,
                valid_time,
                result: objects,
            })
            .await?;
        let correlation_id = Some(Uuid::now_v7());
        let mut requests = self
            .dispatcher
            .boefje_follow_ups(&events, correlation_id)
            .await;
        requests.extend(events.into_iter().map(|event| {
            EnqueueRequest::new(JobPayload::Derive(DeriveJob::new(event)))
                .with_correlation(correlation_id)
        }));
        self.queue.enqueue_many(requests).await
    }

    /// Spawn the worker pools. Calling `start` on a running runtime is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() {
            warn!(target: "kat::runtime", "runtime already started");
            return Ok(());
        }
        if self.shutdown_token.is_cancelled() {
            return Err(PipelineError::Internal(
                "runtime has been shut down".into(),
            ));
        }

        let pools = [
            (JobKind::Boefje, self.config.queue.boefje_workers),
            (JobKind::Normalizer, self.config.queue.normalizer_workers),
            (JobKind::Derive, self.config.queue.derive_workers),
        ];
        for (kind, parallelism) in pools {
            handles.extend(self.spawn_worker_pool(kind, parallelism.max(1)));
        }

        info!(
            target: "kat::runtime",
            workers = handles.len(),
            "pipeline runtime started"
        );
        Ok(())
    }

    fn spawn_worker_pool(
        &self,
        kind: JobKind,
        parallelism: usize,
    ) -> Vec<JoinHandle<()>> {
        let idle =
            Duration::from_millis(self.config.queue.idle_poll_ms.max(1));

        (0..parallelism)
            .map(|i| {
                let worker_id = format!("{kind}-w{i}");
                let queue = Arc::clone(&self.queue);
                let events = Arc::clone(&self.events);
                let dispatcher = Arc::clone(&self.dispatcher);
                let shutdown = self.shutdown_token.clone();

                tokio::spawn(async move {
                    loop {
                        if shutdown.is_cancelled() {
                            debug!(
                                target: "kat::runtime",
                                worker = %worker_id,
                                "worker shutting down"
                            );
                            break;
                        }

                        match queue.dequeue(kind).await {
                            Ok(Some(job)) => {
                                run_job(
                                    queue.as_ref(),
                                    events.as_ref(),
                                    dispatcher.as_ref(),
                                    job,
                                )
                                .await;
                            }
                            Ok(None) => {
                                tokio::select! {
                                    _ = shutdown.cancelled() => {}
                                    _ = tokio::time::sleep(idle) => {}
                                }
                            }
                            Err(err) => {
                                warn!(
                                    target: "kat::runtime",
                                    worker = %worker_id,
                                    error = %err,
                                    "dequeue failed"
                                );
                                tokio::time::sleep(idle).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Run every queued job, including the follow-ups they enqueue, on the
    /// calling task until no kind has ready work. Jobs already leased by
    /// running workers are not waited for.
    pub async fn drain(&self) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let mut progressed = false;
            for kind in JobKind::all_kinds() {
                while let Some(job) = self.queue.dequeue(*kind).await? {
                    progressed = true;
                    match run_job(
                        self.queue.as_ref(),
                        self.events.as_ref(),
                        self.dispatcher.as_ref(),
                        job,
                    )
                    .await
                    {
                        DispatchStatus::Success => summary.completed += 1,
                        DispatchStatus::Failed { .. } => summary.failed += 1,
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        debug!(
            target: "kat::runtime",
            completed = summary.completed,
            failed = summary.failed,
            "queue drained"
        );
        Ok(summary)
    }

    /// Signal workers to stop and wait for them, bounded by the configured
    /// shutdown timeout per worker.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "kat::runtime", "initiating pipeline shutdown");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let timeout =
            Duration::from_secs(self.config.queue.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    target: "kat::runtime",
                    error = ?err,
                    "worker task failed"
                ),
                Err(_) => warn!(
                    target: "kat::runtime",
                    "worker task timed out during shutdown"
                ),
            }
        }

        info!(target: "kat::runtime", "pipeline shutdown complete");
        Ok(())
    }
}

/// Dispatch one job and settle it on the queue.
async fn run_job<Q, E>(
    queue: &Q,
    events: &E,
    dispatcher: &DefaultJobDispatcher<Q, E>,
    job: QueuedJob,
) -> DispatchStatus
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    let job_id = job.job_id();
    let kind = job.kind();
    let status = AssertUnwindSafe(dispatcher.dispatch(&job))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let error = format!(
                "dispatch panicked: {}",
                panic_message(payload.as_ref())
            );
            warn!(
                target: "kat::runtime",
                job_id = %job_id,
                error = %error,
                "job panicked"
            );
            DispatchStatus::Failed { error }
        });

    let (settled, payload) = match &status {
        DispatchStatus::Success => (
            queue.complete(job_id).await,
            PipelineEventPayload::JobCompleted { job_id, kind },
        ),
        DispatchStatus::Failed { error } => (
            queue.fail(job_id, Some(error.clone())).await,
            PipelineEventPayload::JobFailed {
                job_id,
                kind,
                error: error.clone(),
            },
        ),
    };
    if let Err(err) = settled {
        warn!(
            target: "kat::runtime",
            job_id = %job_id,
            error = %err,
            "could not settle job"
        );
    }
    if let Err(err) = events
        .publish(PipelineEvent::new(job.correlation_id, payload))
        .await
    {
        debug!(target: "kat::runtime", error = %err, "event publish failed");
    }
    status
}

/// Wires the dispatcher and its services into a [`PipelineRuntime`].
pub struct PipelineRuntimeBuilder<Q, E>
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    config: PipelineConfig,
    registry: Option<Arc<StaticPluginRegistry>>,
    store: Option<Arc<dyn GraphStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    queue: Option<Arc<Q>>,
    events: Option<Arc<E>>,
    cache: Option<DerivationCache>,
    backend: Option<Arc<dyn BoefjeBackend>>,
}

impl<Q, E> fmt::Debug for PipelineRuntimeBuilder<Q, E>
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRuntimeBuilder")
            .field("config", &self.config)
            .field("has_registry", &self.registry.is_some())
            .field("has_store", &self.store.is_some())
            .field("has_queue", &self.queue.is_some())
            .field("has_events", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl<Q, E> PipelineRuntimeBuilder<Q, E>
where
    Q: QueueService + 'static,
    E: PipelineEventPublisher + 'static,
{
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: None,
            store: None,
            artifacts: None,
            queue: None,
            events: None,
            cache: None,
            backend: None,
        }
    }

    pub fn with_registry(
        mut self,
        registry: Arc<StaticPluginRegistry>,
    ) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_queue(mut self, queue: Arc<Q>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: Arc<E>) -> Self {
        self.events = Some(events);
        self
    }

    /// Share a cache handle, e.g. to inspect hit counts in tests.
    pub fn with_cache(mut self, cache: DerivationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the Boefje execution backend chosen by the configuration.
    pub fn with_boefje_backend(
        mut self,
        backend: Arc<dyn BoefjeBackend>,
    ) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<PipelineRuntime<Q, E>> {
        let registry = self.registry.ok_or_else(|| {
            PipelineError::Internal("plugin registry dependency missing".into())
        })?;
        let queue = self.queue.ok_or_else(|| {
            PipelineError::Internal("queue dependency missing".into())
        })?;
        let events = self.events.ok_or_else(|| {
            PipelineError::Internal("event publisher dependency missing".into())
        })?;
        let store: Arc<dyn GraphStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryGraphStore::new()),
        };
        let artifacts: Arc<dyn ArtifactStore> = match self.artifacts {
            Some(artifacts) => artifacts,
            None => Arc::new(InMemoryArtifactStore::new()),
        };

        let boefje_runner = match self.backend {
            Some(backend) => BoefjeRunner::new(
                backend,
                Duration::from_secs(self.config.boefje.timeout_secs),
            ),
            None => BoefjeRunner::from_config(
                &self.config.boefje,
                Arc::clone(&registry),
            ),
        };
        let engine = DerivationEngine::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            self.cache.unwrap_or_default(),
            self.config.derivation.clone(),
        );

        let services = DispatcherServices {
            store,
            artifacts,
            registry: Arc::clone(&registry),
            engine: Arc::new(engine),
            boefje_runner: Arc::new(boefje_runner),
            normalizer_runner: Arc::new(NormalizerRunner::new(registry)),
        };
        let dispatcher = Arc::new(DefaultJobDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&events),
            services,
            self.config.clone(),
        ));

        Ok(PipelineRuntime {
            config: self.config,
            queue,
            events,
            dispatcher,
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        })
    }
}
