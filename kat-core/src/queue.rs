use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{PipelineError, Result},
    job::{JobId, JobKind, JobPayload},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub payload: JobPayload,
    pub requested_at: DateTime<Utc>,
    /// Shared by every job in one scan-normalize-derive chain.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl EnqueueRequest {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            requested_at: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub kind: JobKind,
    pub accepted: bool,
}

/// A job handed to a worker. Delivery is at least once: a job that is never
/// completed or failed stays in flight.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedJob {
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

impl QueuedJob {
    pub fn job_id(&self) -> JobId {
        self.payload.job_id()
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Queue backend consumed by the runtime. Failed jobs are never re-queued.
#[async_trait]
pub trait QueueService: Send + Sync {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle>;

    async fn dequeue(&self, kind: JobKind) -> Result<Option<QueuedJob>>;

    async fn complete(&self, job_id: JobId) -> Result<()>;

    async fn fail(&self, job_id: JobId, error: Option<String>) -> Result<()>;

    async fn queue_depth(&self, kind: JobKind) -> Result<usize>;

    async fn in_flight(&self) -> Result<usize>;

    /// Enqueue multiple jobs. Default implementation issues jobs one-by-one.
    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobHandle>> {
        let mut out = Vec::with_capacity(requests.len());
        for req in requests {
            out.push(self.enqueue(req).await?);
        }
        Ok(out)
    }
}

/// Optional instrumentation hook for queue implementations that can surface
/// observability data.
#[async_trait]
pub trait QueueInstrumentation: Send + Sync {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot>;
}

/// Aggregated counters for all queue kinds at a specific instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: HashMap<JobKind, QueueSnapshotEntry>,
}

impl QueueSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: HashMap::new(),
        }
    }

    pub fn entry_mut(&mut self, kind: JobKind) -> &mut QueueSnapshotEntry {
        self.queues.entry(kind).or_default()
    }

    pub fn entry(&self, kind: JobKind) -> QueueSnapshotEntry {
        self.queues.get(&kind).cloned().unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    pub ready: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: HashMap<JobKind, VecDeque<QueuedJob>>,
    in_flight: HashMap<JobId, QueuedJob>,
    completed: HashMap<JobKind, usize>,
    failed: HashMap<JobKind, usize>,
    errors: HashMap<JobId, String>,
}

enum Settled {
    Completed,
    Failed(Option<String>),
}

/// FIFO queue per job kind, held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once nothing is ready or in flight.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.in_flight.is_empty()
            && state.ready.values().all(VecDeque::is_empty)
    }

    /// Error recorded when `job_id` was failed.
    pub async fn failure(&self, job_id: JobId) -> Option<String> {
        self.state.lock().await.errors.get(&job_id).cloned()
    }

    async fn settle(&self, job_id: JobId, settled: Settled) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state.in_flight.remove(&job_id).ok_or_else(|| {
            PipelineError::NotFound(format!("in-flight job {job_id}"))
        })?;
        let counter = match settled {
            Settled::Completed => &mut state.completed,
            Settled::Failed(error) => {
                if let Some(error) = error {
                    state.errors.insert(job_id, error);
                }
                &mut state.failed
            }
        };
        *counter.entry(job.kind()).or_default() += 1;
        Ok(())
    }
}

#[async_trait]
impl QueueService for InMemoryQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobHandle> {
        let job = QueuedJob {
            enqueued_at: request.requested_at,
            correlation_id: request.correlation_id,
            payload: request.payload,
        };
        let handle = JobHandle {
            job_id: job.job_id(),
            kind: job.kind(),
            accepted: true,
        };
        let mut state = self.state.lock().await;
        state.ready.entry(handle.kind).or_default().push_back(job);
        Ok(handle)
    }

    async fn dequeue(&self, kind: JobKind) -> Result<Option<QueuedJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.ready.get_mut(&kind).and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };
        state.in_flight.insert(job.job_id(), job.clone());
        Ok(Some(job))
    }

    async fn complete(&self, job_id: JobId) -> Result<()> {
        self.settle(job_id, Settled::Completed).await
    }

    async fn fail(&self, job_id: JobId, error: Option<String>) -> Result<()> {
        self.settle(job_id, Settled::Failed(error)).await
    }

    async fn queue_depth(&self, kind: JobKind) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.ready.get(&kind).map(VecDeque::len).unwrap_or(0))
    }

    async fn in_flight(&self) -> Result<usize> {
        Ok(self.state.lock().await.in_flight.len())
    }
}

#[async_trait]
impl QueueInstrumentation for InMemoryQueue {
    async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        let state = self.state.lock().await;
        let mut snapshot = QueueSnapshot::new(Utc::now());
        for kind in JobKind::all_kinds() {
            let entry = snapshot.entry_mut(*kind);
            entry.ready = state.ready.get(kind).map(VecDeque::len).unwrap_or(0);
            entry.in_flight = state
                .in_flight
                .values()
                .filter(|job| job.kind() == *kind)
                .count();
            entry.completed = state.completed.get(kind).copied().unwrap_or(0);
            entry.failed = state.failed.get(kind).copied().unwrap_or(0);
        }
        Ok(snapshot)
    }
}
