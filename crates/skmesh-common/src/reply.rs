//! JSON reply envelope returned by HTTP peers

use serde::{Deserialize, Serialize};

/// Status used for a successful reply
pub const STATUS_SUCCESS: i32 = 0;
/// Status used for errors that carry no status of their own
pub const STATUS_UNKNOWN: i32 = -1;

/// `{"status": .., "message": .., "data": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply<T> {
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> Reply<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: STATUS_SUCCESS,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn failure(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

impl<T> From<&crate::MeshError> for Reply<T> {
    fn from(err: &crate::MeshError) -> Self {
        Reply::failure(STATUS_UNKNOWN, err.to_string())
    }
}
