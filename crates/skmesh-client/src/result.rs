//! Per-peer outcome of a fan-out call

use std::collections::BTreeMap;

use skmesh_common::{MeshError, Result};

/// Outcome of one peer within a fan-out call: either a result or an error.
#[derive(Debug)]
pub struct MultiResult<T> {
    outcome: Result<T>,
}

impl<T> MultiResult<T> {
    pub fn result(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&MeshError> {
        self.outcome.as_ref().err()
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.outcome
    }
}

impl<T> From<Result<T>> for MultiResult<T> {
    fn from(outcome: Result<T>) -> Self {
        Self { outcome }
    }
}

/// Fan-out outcome keyed by app id.
pub type MultiResults<T> = BTreeMap<u32, MultiResult<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_result_accessors() {
        let ok: MultiResult<u32> = Ok(7).into();
        assert!(ok.is_ok());
        assert_eq!(ok.result(), Some(&7));
        assert!(ok.error().is_none());

        let failed: MultiResult<u32> = Err(MeshError::NodeUnavailable("orders".into())).into();
        assert!(!failed.is_ok());
        assert!(failed.result().is_none());
        assert!(failed.into_result().unwrap_err().is_node_unavailable());
    }
}
