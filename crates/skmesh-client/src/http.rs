//! JSON-over-HTTP client for one peer
//!
//! Every response body is decoded as a `Reply<T>` envelope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use skmesh_common::{MeshError, Reply, Result};
use tracing::debug;
use url::Url;

use crate::error::ClientError;
use crate::pool::PeerTransport;

/// Configuration for HTTP peer clients
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Headers added to every request
    #[serde(skip)]
    pub headers: HeaderMap,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            timeout_ms: 30000,
            headers: HeaderMap::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_timeouts(mut self, connect_ms: u64, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

pub struct HttpClient {
    network: String,
    address: String,
    base: Url,
    client: Client,
    closed: AtomicBool,
}

impl HttpClient {
    /// Validate the endpoint and build the client. No connection is made
    /// until the first request.
    pub fn new(network: &str, address: &str, config: &HttpClientConfig) -> Result<Self> {
        if network.is_empty() {
            return Err(MeshError::config("'network' cannot be empty"));
        }
        if address.is_empty() {
            return Err(MeshError::config("'address' cannot be empty"));
        }

        let address = address.trim_end_matches('/').to_string();
        let base = Url::parse(&address).map_err(ClientError::from)?;
        if base.cannot_be_a_base() {
            return Err(ClientError::NotBaseUrl(address).into());
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.timeout_ms))
            .default_headers(config.headers.clone())
            .build()
            .map_err(ClientError::from)?;

        Ok(Self {
            network: network.to_string(),
            address,
            base,
            client,
            closed: AtomicBool::new(false),
        })
    }

    /// `base` with the segments of `path` appended and `query` (already
    /// url-encoded, may be empty) as the query string.
    pub fn url(&self, path: &str, query: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::NotBaseUrl(self.address.clone()))?
            .pop_if_empty()
            .extend(path.split('/').filter(|s| !s.is_empty()));
        if !query.is_empty() {
            url.set_query(Some(query));
        }
        Ok(url)
    }

    pub async fn get<T, Q>(&self, path: &str, query: &Q) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.get_encoded(path, &encode_query(query)?).await
    }

    pub async fn post<T, Q, B>(&self, path: &str, query: &Q, body: &B) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        self.post_encoded(path, &encode_query(query)?, body).await
    }

    pub(crate) async fn get_encoded<T>(&self, path: &str, query: &str) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
    {
        self.execute::<T, ()>(Method::GET, self.url(path, query)?, None)
            .await
    }

    pub(crate) async fn post_encoded<T, B>(
        &self,
        path: &str,
        query: &str,
        body: &B,
    ) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.execute(Method::POST, self.url(path, query)?, Some(body))
            .await
    }

    async fn execute<T, B>(&self, method: Method, url: Url, body: Option<&B>) -> Result<Reply<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed.into());
        }

        debug!("HTTP {} {}", method, url);

        let mut request = self
            .client
            .request(method, url.clone())
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(ClientError::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }
            .into());
        }

        Ok(response
            .json::<Reply<T>>()
            .await
            .map_err(ClientError::from)?)
    }
}

/// Url-encode a query value once so it can be reused across peers.
pub(crate) fn encode_query<Q>(query: &Q) -> Result<String>
where
    Q: Serialize + ?Sized,
{
    Ok(serde_urlencoded::to_string(query).map_err(ClientError::from)?)
}

#[async_trait]
impl PeerTransport for HttpClient {
    fn network(&self) -> &str {
        &self.network
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(address: &str) -> Result<HttpClient> {
        HttpClient::new("http", address, &HttpClientConfig::default())
    }

    #[test]
    fn test_new_validates_endpoint() {
        assert!(matches!(
            HttpClient::new("", "http://127.0.0.1:8080", &HttpClientConfig::default()),
            Err(MeshError::Config(_))
        ));
        assert!(matches!(client(""), Err(MeshError::Config(_))));
        assert!(matches!(client("not a url"), Err(MeshError::Config(_))));
        assert!(matches!(client("mailto:ops@example.com"), Err(MeshError::Config(_))));
    }

    #[test]
    fn test_url_joins_path() {
        let c = client("http://127.0.0.1:8080/api/").unwrap();
        assert_eq!(c.address(), "http://127.0.0.1:8080/api");
        assert_eq!(
            c.url("/orders/list", "").unwrap().as_str(),
            "http://127.0.0.1:8080/api/orders/list"
        );

        let c = client("http://127.0.0.1:8080").unwrap();
        let query = encode_query(&[("id", "7"), ("tag", "a b")]).unwrap();
        assert_eq!(
            c.url("ping", &query).unwrap().as_str(),
            "http://127.0.0.1:8080/ping?id=7&tag=a+b"
        );
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let c = client("http://127.0.0.1:1").unwrap();
        c.close().await;
        let err = c.get::<String, _>("ping", &()).await.unwrap_err();
        assert!(matches!(err, MeshError::Transport(_)));
    }
}
