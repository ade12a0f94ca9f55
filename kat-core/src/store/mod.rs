//! Contract consumed from the canonical object graph store.

mod memory;

pub use memory::InMemoryGraphStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kat_model::{Ooi, OoiType, Reference, RelationPath, ScanLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),

    #[error("observation rejected: {0}")]
    Rejected(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Objects produced by one plugin run against one source object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Plugin id of the normalizer or rule that produced `result`.
    pub method: String,
    pub source: Reference,
    #[serde(default)]
    pub task_id: Option<JobId>,
    pub valid_time: DateTime<Utc>,
    pub result: Vec<Ooi>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OoiEventKind {
    Created,
    Updated,
}

/// A committed object version, emitted only when stored state changed.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OoiEvent {
    pub kind: OoiEventKind,
    pub reference: Reference,
    pub object_type: OoiType,
    pub valid_time: DateTime<Utc>,
}

impl OoiEvent {
    pub fn created(reference: Reference, valid_time: DateTime<Utc>) -> Self {
        Self {
            kind: OoiEventKind::Created,
            object_type: reference.object_type(),
            reference,
            valid_time,
        }
    }

    pub fn updated(reference: Reference, valid_time: DateTime<Utc>) -> Self {
        Self {
            kind: OoiEventKind::Updated,
            object_type: reference.object_type(),
            reference,
            valid_time,
        }
    }
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Latest version at or before `valid_time`, with its scan profile.
    async fn get(
        &self,
        reference: &Reference,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Option<Ooi>>;

    /// Objects reached by walking `path` from `root`, restricted to
    /// `type_filter` and its subtypes. Each object appears once.
    async fn get_along_relation_path(
        &self,
        root: &Reference,
        path: &RelationPath,
        type_filter: OoiType,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<Vec<Ooi>>;

    /// Idempotent upsert keyed by natural key. Returns events only for
    /// objects that were created or changed.
    async fn save_observation(
        &self,
        observation: Observation,
    ) -> StoreResult<Vec<OoiEvent>>;

    async fn declare_scan_profile(
        &self,
        reference: &Reference,
        level: ScanLevel,
        valid_time: DateTime<Utc>,
    ) -> StoreResult<()>;
}
