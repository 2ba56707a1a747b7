//! Raw-socket client over TCP or a Unix domain socket

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec::{Codec, RawCodec};
use crate::connection::{Connection, ConnectionOptions};
use crate::error::{Result, WireError};
use crate::frame::Frame;
use crate::mux::ConnMux;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => skmesh_common::NETWORK_TCP,
            Network::Unix => skmesh_common::NETWORK_UNIX,
        }
    }
}

impl FromStr for Network {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(WireError::Config("'network' cannot be empty".to_string())),
            skmesh_common::NETWORK_TCP => Ok(Network::Tcp),
            skmesh_common::NETWORK_UNIX => Ok(Network::Unix),
            other => Err(WireError::Config(format!(
                "network '{}' is not supported, expected tcp or unix",
                other
            ))),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client for one raw-socket peer. Every operation other than `init` and
/// `dial` requires a dialled connection.
pub struct NetClient<C = RawCodec> {
    network: String,
    address: String,
    options: ConnectionOptions,
    mux: Arc<ConnMux<C>>,
    conn: RwLock<Option<Arc<Connection<C>>>>,
}

impl<C> NetClient<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(network: impl Into<String>, address: impl Into<String>, mux: Arc<ConnMux<C>>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            options: ConnectionOptions::default(),
            mux,
            conn: RwLock::new(None),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mux(&self) -> &Arc<ConnMux<C>> {
        &self.mux
    }

    /// Validate network and address.
    pub fn init(&self) -> Result<Network> {
        let network = self.network.parse::<Network>()?;
        if self.address.is_empty() {
            return Err(WireError::Config("'address' cannot be empty".to_string()));
        }
        Ok(network)
    }

    /// Connect to the peer, replacing (and closing) any earlier connection.
    pub async fn dial(&self) -> Result<Arc<Connection<C>>> {
        let network = self.init()?;
        let timeout = Duration::from_millis(self.options.connect_timeout_ms);

        let conn = match network {
            Network::Tcp => {
                let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.address))
                    .await
                    .map_err(|_| WireError::ConnectTimeout(self.address.clone()))??;
                stream.set_nodelay(true)?;
                Connection::with_options(stream, self.mux.clone(), &self.options)
            }
            Network::Unix => self.dial_unix(timeout).await?,
        };

        info!("Connected to {} {}", network, self.address);

        let previous = self.conn.write().replace(conn.clone());
        if let Some(previous) = previous {
            debug!("Replacing connection {} to {}", previous.id(), self.address);
            previous.close().await;
        }

        Ok(conn)
    }

    #[cfg(unix)]
    async fn dial_unix(&self, timeout: Duration) -> Result<Arc<Connection<C>>> {
        let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&self.address))
            .await
            .map_err(|_| WireError::ConnectTimeout(self.address.clone()))??;
        Ok(Connection::with_options(stream, self.mux.clone(), &self.options))
    }

    #[cfg(not(unix))]
    async fn dial_unix(&self, _timeout: Duration) -> Result<Arc<Connection<C>>> {
        Err(WireError::Config(
            "unix sockets are not supported on this platform".to_string(),
        ))
    }

    pub fn connection(&self) -> Result<Arc<Connection<C>>> {
        self.conn.read().clone().ok_or(WireError::NotConnected)
    }

    pub async fn send<T>(&self, module_id: u16, message_id: u16, value: &T) -> Result<()>
    where
        C: Codec<T>,
    {
        self.connection()?.send(module_id, message_id, value).await
    }

    pub async fn send_raw(&self, module_id: u16, message_id: u16, body: &[u8]) -> Result<()> {
        self.connection()?.send_raw(module_id, message_id, body).await
    }

    pub async fn send_empty(&self, module_id: u16, message_id: u16) -> Result<()> {
        self.connection()?.send_empty(module_id, message_id).await
    }

    pub async fn read(&self) -> Result<Option<Frame>> {
        self.connection()?.read().await
    }

    pub async fn serve(&self) -> Result<()> {
        self.connection()?.serve().await
    }

    pub async fn close(&self) -> Result<()> {
        self.connection()?.close().await;
        Ok(())
    }
}
