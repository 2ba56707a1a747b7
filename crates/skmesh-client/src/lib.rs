//! skmesh Client - discovery-driven RPC clients
//!
//! This crate provides:
//! - `NodePool`: per-service peer registry reconciled against discovery events
//! - `HttpClient`: JSON-over-HTTP client for one peer
//! - `HttpRpcClient` / `NetRpcClient`: call-all, call-subset, call-random and
//!   call-by-id over HTTP or raw-socket peers
//! - `MultiResults`: per-peer outcome of a fan-out call

pub mod error;
pub mod http;
pub mod pool;
pub mod result;
pub mod rpc;

pub use error::ClientError;
pub use http::{HttpClient, HttpClientConfig};
pub use pool::{NodePool, PeerNode, PeerTransport};
pub use result::{MultiResult, MultiResults};
pub use rpc::{DISPATCH_QUEUE_CAPACITY, HttpRpcClient, NetRpcClient};
