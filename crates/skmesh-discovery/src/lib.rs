//! skmesh Discovery - service registration and subscription
//!
//! This crate provides:
//! - A coordination store seam (`CoordinationStore` / `StoreSession`) and an
//!   in-process `MemoryStore`; `ZooKeeperStore` with the `zookeeper` feature
//! - `SessionClient`: session lifecycle with reconnect and fatal-state handling
//! - `Registrar`: advertises a `PeerDescriptor` as an ephemeral node behind a
//!   stable pointer
//! - `Subscriber`: watches service node lists and reports peer sets

pub mod config;
pub mod error;
pub mod registrar;
pub mod session;
pub mod store;
pub mod subscriber;

pub use config::DiscoveryConfig;
pub use error::{StoreError, StoreResult};
pub use registrar::Registrar;
pub use session::{SessionClient, SessionHandler};
pub use store::{CoordinationStore, MemoryStore, SessionEvent, SessionState, StoreSession};
pub use subscriber::{FnServiceListener, ServiceListener, Subscriber};

#[cfg(feature = "zookeeper")]
pub use store::ZooKeeperStore;
