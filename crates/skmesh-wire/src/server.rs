//! Raw-socket server accepting framed connections

use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Network;
use crate::codec::RawCodec;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{Result, WireError};
use crate::mux::ConnMux;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Accepts connections and serves each one on its own task. All connections
/// share one handler table.
pub struct NetServer<C = RawCodec> {
    network: Network,
    local_address: String,
    listener: parking_lot::Mutex<Option<Listener>>,
    mux: Arc<ConnMux<C>>,
    options: ConnectionOptions,
    connections: DashMap<u64, Arc<Connection<C>>>,
    shutdown: CancellationToken,
}

impl<C> NetServer<C>
where
    C: Send + Sync + 'static,
{
    /// Bind the listener. `address` may use port 0; the bound address is
    /// reported by `local_address()`.
    pub async fn bind(
        network: &str,
        address: &str,
        mux: Arc<ConnMux<C>>,
        options: ConnectionOptions,
    ) -> Result<Arc<Self>> {
        let network = network.parse::<Network>()?;
        if address.is_empty() {
            return Err(WireError::Config("'address' cannot be empty".to_string()));
        }

        let (listener, local_address) = match network {
            Network::Tcp => {
                let listener = TcpListener::bind(address).await?;
                let local = listener.local_addr()?.to_string();
                (Listener::Tcp(listener), local)
            }
            #[cfg(unix)]
            Network::Unix => {
                let listener = tokio::net::UnixListener::bind(address)?;
                (Listener::Unix(listener), address.to_string())
            }
            #[cfg(not(unix))]
            Network::Unix => {
                return Err(WireError::Config(
                    "unix sockets are not supported on this platform".to_string(),
                ));
            }
        };

        info!("Net server bound on {} {}", network, local_address);

        Ok(Arc::new(Self {
            network,
            local_address,
            listener: parking_lot::Mutex::new(Some(listener)),
            mux,
            options,
            connections: DashMap::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn mux(&self) -> &Arc<ConnMux<C>> {
        &self.mux
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accept until `close()` is called. May only be called once.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(WireError::AlreadyServing)?;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.accept(&listener) => accepted,
            };

            match accepted {
                Ok(conn) => self.spawn_connection(conn),
                Err(e) => warn!("Accept on {} failed: {}", self.local_address, e),
            }
        }

        info!("Net server on {} stopped accepting", self.local_address);
        Ok(())
    }

    async fn accept(&self, listener: &Listener) -> Result<Arc<Connection<C>>> {
        match listener {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Connection::with_options(stream, self.mux.clone(), &self.options))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::with_options(stream, self.mux.clone(), &self.options))
            }
        }
    }

    fn spawn_connection(self: &Arc<Self>, conn: Arc<Connection<C>>) {
        debug!(
            "Accepted connection {} from {}",
            conn.id(),
            conn.remote_address()
        );
        self.connections.insert(conn.id(), conn.clone());

        let server = self.clone();
        tokio::spawn(async move {
            if server.shutdown.is_cancelled() {
                conn.close().await;
            } else if let Err(e) = conn.serve().await {
                debug!("Connection {} ended with error: {}", conn.id(), e);
            }
            server.connections.remove(&conn.id());
        });
    }

    /// Stop accepting and close every live connection.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let live: Vec<Arc<Connection<C>>> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in live {
            conn.close().await;
        }

        if self.network == Network::Unix {
            remove_socket_file(&self.local_address);
        }
    }
}

fn remove_socket_file(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!("Failed to remove socket file {}: {}", path, e);
    }
}
