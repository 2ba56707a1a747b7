//! Client error types

use skmesh_common::MeshError;

/// Error type for HTTP peer client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid query: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),

    #[error("address '{0}' cannot be used as a base url")]
    NotBaseUrl(String),

    #[error("server returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("client is closed")]
    Closed,
}

impl From<ClientError> for MeshError {
    fn from(value: ClientError) -> Self {
        match value {
            e @ (ClientError::Url(_) | ClientError::Query(_) | ClientError::NotBaseUrl(_)) => {
                MeshError::config(e.to_string())
            }
            other => MeshError::transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::Status {
            status: 503,
            url: "http://10.0.0.1:8080/ping".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "server returned status 503 for http://10.0.0.1:8080/ping"
        );
        assert_eq!(ClientError::Closed.to_string(), "client is closed");
    }

    #[test]
    fn test_into_mesh_error() {
        let err: MeshError = ClientError::NotBaseUrl("mailto:a@b".to_string()).into();
        assert!(matches!(err, MeshError::Config(_)));

        let err: MeshError = ClientError::Closed.into();
        let MeshError::Transport(source) = err else {
            panic!("expected transport error");
        };
        assert!(matches!(
            source.downcast_ref::<ClientError>(),
            Some(ClientError::Closed)
        ));
    }
}
