//! Coordination session lifecycle shared by the registrar and the subscriber
//!
//! `work()` connects (retrying every 3 seconds), then follows session events:
//! - The first `HasSession` of a session runs the connect handler; repeats
//!   are ignored
//! - `Disconnected` closes the session, runs the close handler without a
//!   session and reconnects after 3 seconds
//! - `AuthFailed` / `ConnectedReadOnly` end `work()` with an error
//!
//! `close()` cancels the lifecycle: the close handler runs with the live
//! session, the session is closed and `work()` returns `Ok(())`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use skmesh_common::{MeshError, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DiscoveryConfig;
use crate::store::{CoordinationStore, SessionEvent, SessionState, StoreSession};

/// Delay before reconnecting after a failed connect or a lost session
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Callbacks driven by the session lifecycle.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// A session has been established. `scope` is cancelled when this
    /// session is torn down or the client is closed.
    async fn on_connect(&self, _session: Arc<dyn StoreSession>, _scope: CancellationToken) {}

    /// The session ended. `None` when the loss was detected after the
    /// session had already gone away.
    async fn on_close(&self, _session: Option<Arc<dyn StoreSession>>) {}
}

enum LoopExit {
    Reconnect,
    Cancelled,
    Fatal(MeshError),
}

pub struct SessionClient {
    config: DiscoveryConfig,
    store: Arc<dyn CoordinationStore>,
    lifecycle: CancellationToken,
    handler: RwLock<Option<Arc<dyn SessionHandler>>>,
}

impl SessionClient {
    pub fn new(config: DiscoveryConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            config,
            store,
            lifecycle: CancellationToken::new(),
            handler: RwLock::new(None),
        }
    }

    /// Validate and normalize the configuration.
    pub fn init(&mut self) -> Result<()> {
        self.config.init()
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn lifecycle(&self) -> &CancellationToken {
        &self.lifecycle
    }

    pub fn close(&self) {
        self.lifecycle.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    /// Run the session loop with the handler set through `set_handler`.
    pub async fn work(&self) -> Result<()> {
        let handler = self
            .handler
            .read()
            .clone()
            .ok_or_else(|| MeshError::config("a session handler must be set before work"))?;
        self.run(handler).await
    }

    pub(crate) async fn run(&self, handler: Arc<dyn SessionHandler>) -> Result<()> {
        loop {
            let connected = tokio::select! {
                _ = self.lifecycle.cancelled() => return Ok(()),
                connected = self.store.connect(&self.config.servers, self.config.timeout()) => connected,
            };

            let (session, mut events) = match connected {
                Ok(connected) => connected,
                Err(e) => {
                    error!("Failed to connect coordination store: {}", e);
                    if !self.pause(RECONNECT_DELAY).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            info!("Coordination session opened on {}", session.server());

            let scope = self.lifecycle.child_token();
            let exit = self
                .event_loop(handler.as_ref(), &session, &mut events, &scope)
                .await;
            scope.cancel();

            match exit {
                LoopExit::Reconnect => {
                    if !self.pause(RECONNECT_DELAY).await {
                        return Ok(());
                    }
                }
                LoopExit::Cancelled => {
                    handler.on_close(Some(session.clone())).await;
                    session.close().await;
                    info!("Coordination session on {} closed", session.server());
                    return Ok(());
                }
                LoopExit::Fatal(err) => {
                    session.close().await;
                    return Err(err);
                }
            }
        }
    }

    async fn event_loop(
        &self,
        handler: &dyn SessionHandler,
        session: &Arc<dyn StoreSession>,
        events: &mut mpsc::Receiver<SessionEvent>,
        scope: &CancellationToken,
    ) -> LoopExit {
        let mut established = false;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.lifecycle.cancelled() => return LoopExit::Cancelled,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                warn!("Coordination session events ended, will reconnect");
                session.close().await;
                handler.on_close(None).await;
                return LoopExit::Reconnect;
            };

            match event.state {
                SessionState::Disconnected => {
                    warn!(
                        "Coordination server {} disconnected, will reconnect",
                        event.server
                    );
                    scope.cancel();
                    session.close().await;
                    handler.on_close(None).await;
                    return LoopExit::Reconnect;
                }
                SessionState::AuthFailed => {
                    return LoopExit::Fatal(MeshError::SessionFatal(format!(
                        "coordination server '{}' authentication failed",
                        event.server
                    )));
                }
                SessionState::ConnectedReadOnly => {
                    return LoopExit::Fatal(MeshError::SessionFatal(format!(
                        "coordination server '{}' is connected but read only",
                        event.server
                    )));
                }
                SessionState::HasSession if established => {
                    debug!("Coordination session on {} already established", event.server);
                }
                SessionState::HasSession => {
                    established = true;
                    handler.on_connect(session.clone(), scope.clone()).await;
                }
                state => debug!("Coordination session state: {:?}", state),
            }
        }
    }

    /// Sleep unless the lifecycle is cancelled first; false when cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.lifecycle.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
