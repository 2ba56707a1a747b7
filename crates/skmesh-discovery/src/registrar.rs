//! Service registration
//!
//! Layout under the root path:
//! - `{root}/{service}/service/{app_id}`: pointer, value is the path of the
//!   active ephemeral node
//! - `{root}/{service}/nodes/_c_...`: ephemeral sequential node holding the
//!   JSON peer descriptor
//!
//! A pointer whose target still exists means the slot is taken by a live
//! instance and registration fails. A pointer whose target is gone is taken
//! over with a versioned write, so two instances racing for the same stale
//! slot cannot both win.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skmesh_common::{MeshError, PeerDescriptor, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::StoreError;
use crate::session::{SessionClient, SessionHandler};
use crate::store::{ANY_VERSION, CoordinationStore, StoreSession};

/// Delay between registration attempts
pub const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Default, Clone)]
struct Registration {
    version: i32,
    path: String,
}

pub struct Registrar {
    base: SessionClient,
    node: Mutex<Option<PeerDescriptor>>,
    registration: Mutex<Registration>,
}

impl Registrar {
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            base: SessionClient::new(config, store),
            node: Mutex::new(None),
            registration: Mutex::new(Registration::default()),
        }
    }

    pub fn set_service_node(&self, node: PeerDescriptor) {
        *self.node.lock() = Some(node);
    }

    /// The advertised descriptor, with its guid once registration assigned one.
    pub fn service_node(&self) -> Option<PeerDescriptor> {
        self.node.lock().clone()
    }

    pub fn init(&mut self) -> Result<()> {
        if self.node.lock().is_none() {
            return Err(MeshError::config("please set service node before init"));
        }
        self.base.init()
    }

    /// Run until `close()` or a fatal session error.
    pub async fn work(self: &Arc<Self>) -> Result<()> {
        self.base.run(self.clone()).await
    }

    pub fn close(&self) {
        self.base.close();
    }

    /// Pointer path of the current registration, if any.
    pub fn registered_path(&self) -> Option<String> {
        let registration = self.registration.lock();
        (!registration.path.is_empty()).then(|| registration.path.clone())
    }

    /// Publish the descriptor once. Any ephemeral node created by a failed
    /// attempt is removed again before returning the error.
    pub async fn register_once(&self, session: &dyn StoreSession) -> Result<String> {
        *self.registration.lock() = Registration::default();

        let node = {
            let mut guard = self.node.lock();
            let node = guard
                .as_mut()
                .ok_or_else(|| MeshError::config("please set service node before init"))?;
            node.ensure_guid();
            node.clone()
        };
        let data = serde_json::to_vec(&node)?;

        let config = self.base.config();
        let service_path = config.service_path(&node.name);
        let nodes_path = config.nodes_path(&node.name);
        let pointer = format!("{}/{}", service_path, node.app_id);
        let prefix = format!("{}/", nodes_path);

        match session.get(&pointer).await {
            Ok((target, stat)) => {
                let target = String::from_utf8_lossy(&target).into_owned();
                match session.exists(&target).await {
                    Ok(Some(_)) => {
                        return Err(MeshError::AlreadyRegistered {
                            service: node.name.clone(),
                            app_id: node.app_id,
                        });
                    }
                    Ok(None) | Err(StoreError::InvalidPath(_)) => {
                        debug!("Taking over stale registration {} -> {}", pointer, target);
                    }
                    Err(e) => return Err(e.into()),
                }

                let child = session
                    .create_protected_ephemeral_sequential(&prefix, &data)
                    .await?;
                match session.set(&pointer, child.as_bytes(), stat.version).await {
                    Ok(stat) => {
                        *self.registration.lock() = Registration {
                            version: stat.version,
                            path: pointer.clone(),
                        };
                        Ok(pointer)
                    }
                    Err(e) => {
                        discard(session, &child).await;
                        Err(e.into())
                    }
                }
            }
            Err(StoreError::NoNode(_)) => {
                create_parents(session, &nodes_path).await?;
                let child = session
                    .create_protected_ephemeral_sequential(&prefix, &data)
                    .await?;

                let created = match create_parents(session, &service_path).await {
                    Ok(()) => session
                        .create(&pointer, child.as_bytes())
                        .await
                        .map_err(MeshError::from),
                    Err(e) => Err(e),
                };
                match created {
                    Ok(path) => {
                        *self.registration.lock() = Registration {
                            version: 0,
                            path: path.clone(),
                        };
                        Ok(path)
                    }
                    Err(e) => {
                        discard(session, &child).await;
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the pointer created by this instance, using the recorded
    /// version. A second call is a no-op.
    pub async fn deregister(&self, session: &dyn StoreSession) {
        let registration = std::mem::take(&mut *self.registration.lock());
        if registration.path.is_empty() {
            debug!("Nothing to deregister");
            return;
        }

        match session
            .delete(&registration.path, registration.version)
            .await
        {
            Ok(()) => info!("Service deregister success, node: {}", registration.path),
            Err(
                e @ (StoreError::NoNode(_)
                | StoreError::BadVersion { .. }
                | StoreError::SessionClosed),
            ) => {
                debug!("Skipping deregister of {}: {}", registration.path, e);
            }
            Err(e) => warn!("Service deregister failed, node: {}, {}", registration.path, e),
        }
    }
}

#[async_trait]
impl SessionHandler for Registrar {
    async fn on_connect(&self, session: Arc<dyn StoreSession>, scope: CancellationToken) {
        loop {
            match self.register_once(session.as_ref()).await {
                Ok(path) => {
                    info!("Service register success, node: {}", path);
                    return;
                }
                Err(e) => error!("Service register failed: {}", e),
            }

            if !session.state().is_connected() {
                warn!("Coordination session lost during registration, waiting for reconnect");
                return;
            }

            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(REGISTER_RETRY_DELAY) => {}
            }
        }
    }

    async fn on_close(&self, session: Option<Arc<dyn StoreSession>>) {
        if let Some(session) = session
            && session.state().is_connected()
        {
            self.deregister(session.as_ref()).await;
        }
    }
}

/// Create every missing node along `path`; existing or forbidden nodes are
/// skipped.
async fn create_parents(session: &dyn StoreSession, path: &str) -> Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match session.create(&current, &[]).await {
            Ok(_) | Err(StoreError::NodeExists(_)) | Err(StoreError::NoAuth(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn discard(session: &dyn StoreSession, path: &str) {
    if let Err(e) = session.delete(path, ANY_VERSION).await {
        warn!("Failed to remove ephemeral node {}: {}", path, e);
    }
}
