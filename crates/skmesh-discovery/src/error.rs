//! Coordination store errors

use skmesh_common::MeshError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    /// `actual` is `-1` when the store does not report the current version.
    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("not authorized: {0}")]
    NoAuth(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("session closed")]
    SessionClosed,
}

impl StoreError {
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode(_))
    }
}

impl From<StoreError> for MeshError {
    fn from(value: StoreError) -> Self {
        MeshError::store(value)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
