use std::any::Any;

use kat_model::{ModelError, ScanLevel};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Infrastructure failure while running a plugin.
    #[error("Runner failure: {0}")]
    TransientRunner(String),

    /// Raw evidence a normalizer could not parse.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Rule {rule} failed: {message}")]
    RuleExecution { rule: String, message: String },

    #[error("Context resolution failed: {0}")]
    ContextResolution(String),

    /// Declared plugin contracts disagree with the object schema.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    #[error("Insufficient clearance: requires {required}, object has {actual}")]
    InsufficientClearance {
        required: ScanLevel,
        actual: ScanLevel,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::RuleExecution {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Message carried by a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
