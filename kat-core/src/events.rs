//! Pipeline notifications and the in-process bus that fans them out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kat_model::Reference;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::Result,
    job::{JobId, JobKind},
    registry::PluginId,
    store::OoiEvent,
};

/// Metadata envelope attached to every pipeline event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>) -> Self {
        let event_id = Uuid::now_v7();
        Self {
            version: 1,
            event_id,
            correlation_id: correlation_id.unwrap_or(event_id),
            occurred_at: Utc::now(),
        }
    }
}

/// Outcome of one (rule, root) evaluation as reported on the bus.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEvaluation {
    Derived { objects: usize, cached: bool },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PipelineEventPayload {
    JobEnqueued {
        job_id: JobId,
        kind: JobKind,
    },
    JobCompleted {
        job_id: JobId,
        kind: JobKind,
    },
    JobFailed {
        job_id: JobId,
        kind: JobKind,
        error: String,
    },
    ObjectsCommitted {
        job_id: JobId,
        events: Vec<OoiEvent>,
    },
    RuleEvaluated {
        rule: PluginId,
        root: Reference,
        evaluation: RuleEvaluation,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub meta: EventMeta,
    pub payload: PipelineEventPayload,
}

impl PipelineEvent {
    pub fn new(
        correlation_id: Option<Uuid>,
        payload: PipelineEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta::new(correlation_id),
            payload,
        }
    }
}

#[async_trait]
pub trait PipelineEventPublisher: Send + Sync {
    async fn publish(&self, event: PipelineEvent) -> Result<()>;
}

/// Lightweight in-process event bus. Publishing never blocks and never fails
/// when nobody is listening.
#[derive(Debug)]
pub struct InProcEventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl PipelineEventPublisher for InProcEventBus {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

pub trait PipelineEventStream {
    fn subscribe_pipeline(&self) -> broadcast::Receiver<PipelineEvent>;
}

impl PipelineEventStream for InProcEventBus {
    fn subscribe_pipeline(&self) -> broadcast::Receiver<PipelineEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcEventBus::new(8);
        let mut rx = bus.subscribe_pipeline();
        let job_id = JobId::new();
        bus.publish(PipelineEvent::new(
            None,
            PipelineEventPayload::JobEnqueued {
                job_id,
                kind: JobKind::Boefje,
            },
        ))
        .await
        .expect("publish");

        let event = rx.recv().await.expect("event delivered");
        assert_eq!(event.meta.correlation_id, event.meta.event_id);
        assert!(matches!(
            event.payload,
            PipelineEventPayload::JobEnqueued {
                job_id: id,
                kind: JobKind::Boefje,
            } if id == job_id
        ));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = InProcEventBus::new(1);
        bus.publish(PipelineEvent::new(
            Some(Uuid::now_v7()),
            PipelineEventPayload::JobCompleted {
                job_id: JobId::new(),
                kind: JobKind::Derive,
            },
        ))
        .await
        .expect("publish");
    }
}
