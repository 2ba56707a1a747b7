//! Peer descriptors advertised through the coordination store

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Network endpoint of a peer (`tcp` / `unix` for raw sockets, a base URL for HTTP).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceNetwork {
    pub network: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Map<String, Value>>,
}

impl ServiceNetwork {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Two endpoints are the same connection target when network and address match.
    pub fn same_endpoint(&self, other: &ServiceNetwork) -> bool {
        self.network == other.network && self.address == other.address
    }
}

/// A remote process instance of a named service.
///
/// Serialized as JSON into the ephemeral node of the coordination store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    #[serde(default)]
    pub guid: String,
    pub name: String,
    pub app_id: u32,
    #[serde(default)]
    pub inner: Option<ServiceNetwork>,
    #[serde(default, rename = "exter")]
    pub outer: Option<ServiceNetwork>,
}

impl PeerDescriptor {
    /// Create a descriptor with a freshly generated guid.
    pub fn new(name: impl Into<String>, app_id: u32) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            app_id,
            inner: None,
            outer: None,
        }
    }

    pub fn with_inner(mut self, inner: ServiceNetwork) -> Self {
        self.inner = Some(inner);
        self
    }

    pub fn with_outer(mut self, outer: ServiceNetwork) -> Self {
        self.outer = Some(outer);
        self
    }

    /// Assign a guid if none has been assigned yet.
    pub fn ensure_guid(&mut self) {
        if self.guid.is_empty() {
            self.guid = uuid::Uuid::new_v4().to_string();
        }
    }
}

/// Identity of the local server process, used to exclude itself from
/// discovered peer sets.
pub trait LocalNode: Send + Sync {
    fn name(&self) -> &str;
    fn app_id(&self) -> u32;

    fn is_self(&self, peer: &PeerDescriptor) -> bool {
        peer.name == self.name() && peer.app_id == self.app_id()
    }
}

impl LocalNode for PeerDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn app_id(&self) -> u32 {
        self.app_id
    }
}
