use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown object type: {0}")]
    UnknownType(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid scan level: {0}")]
    InvalidScanLevel(u8),

    #[error("Unknown relation {object_type}.{field}")]
    UnknownRelation { object_type: String, field: String },

    #[error("Invalid relation path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ModelError>;
