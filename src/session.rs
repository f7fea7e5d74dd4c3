// # Session / Coordinator State Module
//
// Per-backend state that identifies the coordinator of the current query
// and bootstraps the control channel on first use.
//
// ## Features
//
// - Coordinator identification, set either by receiving a client query
//   directly or by a peer's `set_query_id` call
// - Recursion guard (`query_in_progress`) around internal meta-calls
// - Lazy control-channel bootstrap to every peer on first query

use crate::common::NodeId;
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::network::ControlChannel;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-session state. One instance lives for the lifetime of a client
/// connection.
pub struct SessionState {
    config: ClusterConfig,
    /// `None` until this backend becomes, or is told it is not, the
    /// coordinator of the current query.
    coord_node: RwLock<Option<NodeId>>,
    /// Guards against recursively treating an internal meta-call (
    /// `set_query_id`, a utility statement) as a fresh user query.
    query_in_progress: AtomicBool,
    next_query_id: AtomicU64,
    control: RwLock<Option<Arc<ControlChannel>>>,
}

impl SessionState {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            coord_node: RwLock::new(None),
            query_in_progress: AtomicBool::new(false),
            next_query_id: AtomicU64::new(1),
            control: RwLock::new(None),
        }
    }

    pub fn my_node(&self) -> NodeId {
        self.config.node
    }

    pub fn nnodes(&self) -> u32 {
        self.config.nnodes
    }

    pub async fn coord_node(&self) -> Option<NodeId> {
        *self.coord_node.read().await
    }

    /// Called when the local backend receives a client query directly: it
    /// becomes the coordinator for that query.
    pub async fn become_coordinator(&self) -> NodeId {
        let mut coord = self.coord_node.write().await;
        *coord = Some(self.my_node());
        self.my_node()
    }

    /// Called by the control channel's `set_query_id` handler when a peer
    /// announces itself as coordinator.
    pub async fn set_coordinator(&self, coord_node: NodeId) {
        *self.coord_node.write().await = Some(coord_node);
    }

    /// Is `node` the coordinator of the current query?
    pub async fn is_coordinator(&self, node: NodeId) -> bool {
        *self.coord_node.read().await == Some(node)
    }

    pub fn begin_query(&self) -> bool {
        !self.query_in_progress.swap(true, Ordering::SeqCst)
    }

    pub fn end_query(&self) {
        self.query_in_progress.store(false, Ordering::SeqCst);
    }

    pub fn is_query_in_progress(&self) -> bool {
        self.query_in_progress.load(Ordering::SeqCst)
    }

    pub fn next_query_id(&self) -> u64 {
        self.next_query_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Open the control channel to every peer, if not already open. Called
    /// on the first query of a session when this backend is the
    /// coordinator.
    pub async fn ensure_control_channel(&self) -> Result<Arc<ControlChannel>> {
        {
            if let Some(existing) = self.control.read().await.as_ref() {
                return Ok(existing.clone());
            }
        }
        let channel = Arc::new(
            ControlChannel::connect_all(&self.config.hosts, &self.config.ports, self.my_node())
                .await?,
        );
        *self.control.write().await = Some(channel.clone());
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            node: 0,
            nnodes: 2,
            hosts: vec!["127.0.0.1".to_string(), "127.0.0.1".to_string()],
            ports: vec![5432, 5433],
            eports: 64,
            eport_base: 18000,
        }
    }

    #[tokio::test]
    async fn becoming_coordinator_sets_own_node() {
        let session = SessionState::new(test_config());
        assert_eq!(session.coord_node().await, None);
        let coord = session.become_coordinator().await;
        assert_eq!(coord, 0);
        assert_eq!(session.coord_node().await, Some(0));
    }

    #[tokio::test]
    async fn set_coordinator_from_peer_overrides() {
        let session = SessionState::new(test_config());
        session.set_coordinator(1).await;
        assert_eq!(session.coord_node().await, Some(1));
        assert!(session.is_coordinator(1).await);
        assert!(!session.is_coordinator(0).await);
    }

    #[test]
    fn begin_query_guards_against_recursion() {
        let session = SessionState::new(test_config());
        assert!(session.begin_query());
        assert!(!session.begin_query());
        session.end_query();
        assert!(session.begin_query());
    }

    #[test]
    fn query_ids_are_monotonic() {
        let session = SessionState::new(test_config());
        let a = session.next_query_id();
        let b = session.next_query_id();
        assert!(b > a);
    }
}
