//! Discovery-driven RPC clients
//!
//! Every call pattern reads the pool under its shared lock and fails with
//! `NodeUnavailable` when the service is unknown:
//! - call-all fans out to every current peer and waits for all of them
//! - call-subset does the same for the given app ids, skipping unknown ids
//! - call-random picks one peer uniformly
//! - call-by-id targets one app id

mod http;
mod net;

use std::collections::BTreeSet;
use std::sync::Arc;

use skmesh_common::{MeshError, Result};

pub use http::HttpRpcClient;
pub use net::{DISPATCH_QUEUE_CAPACITY, NetRpcClient, PeerConnectHandler, PeerMessageHandler};

use crate::pool::{NodePool, PeerNode};
use crate::result::MultiResults;

fn unavailable(service: &str) -> MeshError {
    MeshError::NodeUnavailable(service.to_string())
}

/// Peers of `service`, restricted to `app_ids` when given. Unknown and
/// repeated ids are skipped.
fn select_nodes<T>(
    pool: &NodePool<T>,
    service: &str,
    app_ids: Option<&[u32]>,
) -> Result<Vec<Arc<PeerNode<T>>>> {
    let nodes = pool.nodes(service).ok_or_else(|| unavailable(service))?;
    Ok(match app_ids {
        Some(app_ids) => app_ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|app_id| nodes.get(app_id).cloned())
            .collect(),
        None => nodes.values().cloned().collect(),
    })
}

fn random_node<T>(pool: &NodePool<T>, service: &str) -> Result<Arc<PeerNode<T>>> {
    pool.random_node(service).ok_or_else(|| unavailable(service))
}

fn app_id_node<T>(pool: &NodePool<T>, service: &str, app_id: u32) -> Result<Arc<PeerNode<T>>> {
    pool.node(service, app_id)
        .ok_or_else(|| MeshError::NodeUnavailable(format!("{}:{}", service, app_id)))
}

/// Pair fan-out results with the app ids they were issued for.
fn collect_results<T>(app_ids: Vec<u32>, results: Vec<Result<T>>) -> MultiResults<T> {
    app_ids
        .into_iter()
        .zip(results)
        .map(|(app_id, result)| (app_id, result.into()))
        .collect()
}
