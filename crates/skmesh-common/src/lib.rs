//! skmesh Common - Shared types, errors, and concurrency primitives
//!
//! This crate provides the foundational pieces used by every skmesh component:
//! - Error taxonomy (`MeshError`, `MultiError`)
//! - Peer descriptors advertised through the coordination store
//! - The JSON reply envelope used by HTTP peers
//! - Fan-out helpers: wait-for-all, wait-for-first, wait-for-first-success

pub mod error;
pub mod model;
pub mod reply;
pub mod wait;

// Re-exports for convenience
pub use error::{MeshError, MultiError, Result};
pub use model::{LocalNode, PeerDescriptor, ServiceNetwork};
pub use reply::Reply;
pub use wait::{wait_all, wait_any, wait_any_success};

/// Default root path of the service tree in the coordination store
pub const DEFAULT_ROOT_PATH: &str = "/sk.org/server";

/// Network kinds understood by raw-socket peers
pub const NETWORK_TCP: &str = "tcp";
pub const NETWORK_UNIX: &str = "unix";
