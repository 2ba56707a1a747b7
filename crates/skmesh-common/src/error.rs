//! Error types for skmesh
//!
//! `MeshError` is the error surfaced by every public operation. Lower layers
//! (wire, coordination store, HTTP) keep their own typed errors and are boxed
//! into `Transport` / `Store` so callers can still downcast them.

use std::fmt::{Display, Formatter};

/// Boxed error used to carry a lower-layer failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Application-level error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Empty required field, unknown transport kind, missing handler
    #[error("configuration error: {0}")]
    Config(String),

    #[error("the node is unavailable: {0}")]
    NodeUnavailable(String),

    /// Authentication failure or read-only session; never retried
    #[error("session fatal: {0}")]
    SessionFatal(String),

    #[error("service '{service}:{app_id}' is already registered")]
    AlreadyRegistered { service: String, app_id: u32 },

    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("coordination store error: {0}")]
    Store(#[source] BoxError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MeshError {
    pub fn config(msg: impl Into<String>) -> Self {
        MeshError::Config(msg.into())
    }

    /// Wrap any transport-level failure (socket, HTTP client, ...).
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MeshError::Transport(Box::new(err))
    }

    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MeshError::Store(Box::new(err))
    }

    pub fn is_node_unavailable(&self) -> bool {
        matches!(self, MeshError::NodeUnavailable(_))
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(value: serde_json::Error) -> Self {
        MeshError::Codec(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

/// Combined failure of a set of operations where none succeeded.
///
/// Errors are kept in input order.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<MeshError>,
}

impl MultiError {
    pub fn new(errors: Vec<MeshError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[MeshError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<MeshError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Display for MultiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no operations to wait for");
        }

        write!(f, "all {} operations failed: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{}] {}", i, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
