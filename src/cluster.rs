//! Node-to-node command forwarding.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::CommandEnvelope;
use crate::coordinator::ShardCoordinator;
use crate::error::{RemoteFailure, TransportError};
use crate::shard::ShardRoute;

/// A command on its way to the node that owns its shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedCommand {
    /// Route as computed by the sending node. The receiver re-checks
    /// ownership against its own table.
    pub route: ShardRoute,
    /// The command.
    pub envelope: CommandEnvelope,
}

/// Delivers forwarded commands to peer nodes.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Send `command` to `target` and wait for its serialized reply.
    ///
    /// # Errors
    ///
    /// [`TransportError::Unreachable`] if `target` cannot be reached, or
    /// [`TransportError::Remote`] if it handled the command and it failed.
    async fn forward(
        &self,
        target: &str,
        command: ForwardedCommand,
    ) -> Result<serde_json::Value, TransportError>;
}

struct Peer {
    coordinator: Weak<ShardCoordinator>,
    connected: bool,
}

/// Transport between coordinators living in one process.
///
/// Messages are serialized to JSON and back on every hop so the wire
/// format is exercised. Peers can be disconnected to simulate a partition.
/// Clones share the same peer table.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    peers: Arc<RwLock<HashMap<String, Peer>>>,
}

impl InMemoryTransport {
    /// Create a transport with no peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `coordinator` reachable under its node id.
    pub fn register(&self, coordinator: &Arc<ShardCoordinator>) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                coordinator.node_id().to_owned(),
                Peer {
                    coordinator: Arc::downgrade(coordinator),
                    connected: true,
                },
            );
    }

    /// Make `node_id` unreachable.
    pub fn disconnect(&self, node_id: &str) {
        self.set_connected(node_id, false);
    }

    /// Make `node_id` reachable again.
    pub fn reconnect(&self, node_id: &str) {
        self.set_connected(node_id, true);
    }

    fn set_connected(&self, node_id: &str, connected: bool) {
        if let Some(peer) = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(node_id)
        {
            peer.connected = connected;
        }
    }

    fn peer(&self, node_id: &str) -> Option<Arc<ShardCoordinator>> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let peer = peers.get(node_id)?;
        if !peer.connected {
            return None;
        }
        peer.coordinator.upgrade()
    }
}

#[async_trait]
impl ClusterTransport for InMemoryTransport {
    async fn forward(
        &self,
        target: &str,
        command: ForwardedCommand,
    ) -> Result<serde_json::Value, TransportError> {
        let coordinator = self
            .peer(target)
            .ok_or_else(|| TransportError::Unreachable(target.to_owned()))?;

        let malformed = |e: serde_json::Error| TransportError::Remote(RemoteFailure::Malformed(e.to_string()));
        let wire = serde_json::to_vec(&command).map_err(malformed)?;
        let command: ForwardedCommand = serde_json::from_slice(&wire).map_err(malformed)?;

        let reply = coordinator
            .handle_forwarded(command)
            .await
            .map_err(TransportError::Remote)?;
        let wire = serde_json::to_vec(&reply).map_err(malformed)?;
        serde_json::from_slice(&wire).map_err(malformed)
    }
}
