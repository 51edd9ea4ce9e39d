//! Shard-aware command routing and shard handoff.
//!
//! A [`ShardCoordinator`] is the single ingress for commands on one node.
//! It maps each entity to its shard, runs the command locally when this node
//! owns that shard, and otherwise forwards it to the owner over a
//! [`ClusterTransport`].
//!
//! Local execution holds a read guard on the routing table for the whole
//! command. A membership change takes the write guard, which therefore
//! waits for in-flight local commands, then passivates every resident actor
//! on a shard this node is losing before the new table becomes visible.
//! Across nodes the change is two-phase: every node first
//! [prepares](ShardCoordinator::prepare_membership) (releases lost shards
//! and fences them), then every node
//! [commits](ShardCoordinator::commit_membership). While fenced, a moved
//! shard answers [`ExecuteError::Unavailable`], so no entity is ever active
//! on two nodes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::cluster::{ClusterTransport, ForwardedCommand};
use crate::command::{CommandContext, CommandEnvelope};
use crate::error::{ExecuteError, RemoteFailure, ShardError, TransportError};
use crate::event::{EntityKey, StreamId};
use crate::shard::{Membership, ShardMove, ShardRoute, ShardTable, shard_of};
use crate::store::AggregateStore;

/// Epoch of the table a coordinator starts with.
const INITIAL_EPOCH: u64 = 1;

struct Routing {
    table: ShardTable,
    /// Table being handed over to; set between prepare and commit.
    pending: Option<ShardTable>,
}

impl Routing {
    /// `true` if `node` owns `shard` now but will not after the pending
    /// change.
    fn releasing(&self, shard: u32, node: &str) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|next| next.owner(shard) != Some(node))
    }
}

/// Summary of one membership change on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffPlan {
    /// Epoch of the new table.
    pub epoch: u64,
    /// Every shard whose owner changes, cluster-wide.
    pub moves: Vec<ShardMove>,
    /// Shards this node gives up.
    pub released: usize,
    /// Shards this node takes over.
    pub acquired: usize,
    /// Resident actors passivated because their shard moved away.
    pub passivated: usize,
}

/// Routes commands to the node that owns their entity's shard.
pub struct ShardCoordinator {
    node_id: String,
    store: AggregateStore,
    transport: Arc<dyn ClusterTransport>,
    routing: RwLock<Routing>,
}

impl std::fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCoordinator")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl ShardCoordinator {
    /// Create a coordinator for `node_id` with the shard table of
    /// `membership`.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError`] if the node id is blank or no table can be
    /// built for `membership`.
    pub fn new(
        node_id: impl Into<String>,
        store: AggregateStore,
        membership: &Membership,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<Self, ShardError> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(ShardError::EmptyNodeId);
        }
        let table = ShardTable::compute(membership, store.config().shard_count, INITIAL_EPOCH)?;
        Ok(Self {
            node_id,
            store,
            transport,
            routing: RwLock::new(Routing {
                table,
                pending: None,
            }),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// This node's runtime context.
    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    /// Snapshot of the active shard table.
    pub async fn table(&self) -> ShardTable {
        self.routing.read().await.table.clone()
    }

    /// Where a command for `A` at `key` would run right now.
    pub async fn route_for<A: Aggregate>(&self, key: &EntityKey) -> ShardRoute {
        self.routing
            .read()
            .await
            .table
            .route(&StreamId::of::<A>(key), &self.node_id)
    }

    /// Execute a command on whichever node owns `key`'s shard.
    ///
    /// # Errors
    ///
    /// - [`ExecuteError::Validation`] if the aggregate rejected the command.
    /// - [`ExecuteError::Unavailable`] if the owner is unreachable, is
    ///   handing the shard off, or disagrees about ownership.
    /// - [`ExecuteError::Timeout`] if no reply arrived within `timeout`. The
    ///   command may still have been applied.
    /// - [`ExecuteError::ConcurrencyConflict`] / [`ExecuteError::Persistence`]
    ///   from the owner's journal.
    pub async fn execute<A>(
        &self,
        key: &EntityKey,
        cmd: A::Command,
        ctx: CommandContext,
        timeout: Duration,
    ) -> Result<A::Reply, ExecuteError<A::Error>>
    where
        A: Aggregate,
        A::Command: Serialize,
        A::Reply: DeserializeOwned,
        A::Error: DeserializeOwned,
    {
        let stream = StreamId::of::<A>(key);
        let span = tracing::info_span!(
            "route",
            node = %self.node_id,
            aggregate_type = A::AGGREGATE_TYPE,
            entity_key = %key,
        );
        match tokio::time::timeout(timeout, self.route::<A>(&stream, cmd, ctx))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(entity_key = %key, ?timeout, "command timed out");
                Err(ExecuteError::Timeout)
            }
        }
    }

    async fn route<A>(
        &self,
        stream: &StreamId,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<A::Reply, ExecuteError<A::Error>>
    where
        A: Aggregate,
        A::Command: Serialize,
        A::Reply: DeserializeOwned,
        A::Error: DeserializeOwned,
    {
        let routing = self.routing.read().await;
        let route = routing.table.route(stream, &self.node_id);

        if route.local {
            if routing.releasing(route.shard, &self.node_id) {
                return Err(ExecuteError::Unavailable(format!(
                    "shard {} is being handed off",
                    route.shard
                )));
            }
            // The guard stays held until the command completes.
            let result = self.store.execute::<A>(&stream.key, cmd, ctx).await;
            drop(routing);
            return result.map_err(|e| match e {
                ExecuteError::ActorGone => {
                    ExecuteError::Unavailable("aggregate actor stopped".into())
                }
                other => other,
            });
        }
        drop(routing);

        tracing::debug!(owner = %route.owner, shard = route.shard, "forwarding command");
        let envelope = CommandEnvelope::encode::<A>(&stream.key, &cmd, &ctx)
            .map_err(|e| ExecuteError::Unavailable(format!("command not encodable: {e}")))?;
        let owner = route.owner.clone();
        match self
            .transport
            .forward(&owner, ForwardedCommand { route, envelope })
            .await
        {
            Ok(reply) => serde_json::from_value(reply).map_err(|e| {
                ExecuteError::Unavailable(format!("undecodable reply from {owner}: {e}"))
            }),
            Err(TransportError::Unreachable(node)) => {
                Err(ExecuteError::Unavailable(format!("owner {node} unreachable")))
            }
            Err(TransportError::Remote(failure)) => Err(ExecuteError::from_remote(failure)),
        }
    }

    /// Execute a command another node forwarded here.
    ///
    /// Rejects the command with [`RemoteFailure::Unavailable`] unless this
    /// node owns the shard under its own table, is not releasing it, and its
    /// table is at least as new as the sender's.
    pub async fn handle_forwarded(
        &self,
        forwarded: ForwardedCommand,
    ) -> Result<serde_json::Value, RemoteFailure> {
        let routing = self.routing.read().await;
        let stream = StreamId::new(
            forwarded.envelope.aggregate_type.clone(),
            forwarded.envelope.entity_key.clone(),
        );
        let route = routing.table.route(&stream, &self.node_id);
        if !route.local {
            return Err(RemoteFailure::Unavailable(format!(
                "node {} does not own shard {} at epoch {}",
                self.node_id, route.shard, route.epoch
            )));
        }
        if routing.releasing(route.shard, &self.node_id) {
            return Err(RemoteFailure::Unavailable(format!(
                "shard {} is being handed off",
                route.shard
            )));
        }
        if forwarded.route.epoch > route.epoch {
            return Err(RemoteFailure::Unavailable(format!(
                "node {} is at epoch {}, sender at {}",
                self.node_id, route.epoch, forwarded.route.epoch
            )));
        }

        tracing::debug!(
            node = %self.node_id,
            stream = %stream,
            shard = route.shard,
            "handling forwarded command"
        );
        let result = self.store.dispatch(forwarded.envelope).await;
        drop(routing);
        result
    }

    /// First phase of a membership change: compute the next table,
    /// passivate every resident actor on a shard this node loses, and fence
    /// those shards until [`commit_membership`](Self::commit_membership).
    ///
    /// Waits for in-flight local commands to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError`] if no table can be built for `membership`.
    pub async fn prepare_membership(&self, membership: &Membership) -> Result<HandoffPlan, ShardError> {
        let mut routing = self.routing.write().await;
        let base_epoch = routing
            .pending
            .as_ref()
            .map_or(routing.table.epoch(), ShardTable::epoch);
        let next = ShardTable::compute(membership, routing.table.shard_count(), base_epoch + 1)?;

        let moves = routing.table.moves_to(&next);
        let released: BTreeSet<u32> = moves
            .iter()
            .filter(|m| m.from == self.node_id)
            .map(|m| m.shard)
            .collect();
        let acquired = moves.iter().filter(|m| m.to == self.node_id).count();

        let shard_count = next.shard_count();
        let passivated = self
            .store
            .passivate_where(|stream| released.contains(&shard_of(stream, shard_count)))
            .await;

        let plan = HandoffPlan {
            epoch: next.epoch(),
            moves,
            released: released.len(),
            acquired,
            passivated,
        };
        routing.pending = Some(next);

        tracing::info!(
            node = %self.node_id,
            epoch = plan.epoch,
            released = plan.released,
            acquired = plan.acquired,
            passivated = plan.passivated,
            "shard handoff prepared"
        );
        Ok(plan)
    }

    /// Second phase of a membership change: make the prepared table active.
    /// Returns its epoch, or `None` if nothing was prepared.
    pub async fn commit_membership(&self) -> Option<u64> {
        let mut routing = self.routing.write().await;
        let next = routing.pending.take()?;
        let epoch = next.epoch();
        routing.table = next;
        tracing::info!(node = %self.node_id, epoch, "shard table committed");
        Some(epoch)
    }

    /// Prepare and commit a membership change on this node alone.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError`] if no table can be built for `membership`.
    pub async fn apply_membership(&self, membership: &Membership) -> Result<HandoffPlan, ShardError> {
        let plan = self.prepare_membership(membership).await?;
        self.commit_membership().await;
        Ok(plan)
    }
}

/// Apply a membership change across `nodes`: every node releases its lost
/// shards before any node starts serving its gained ones.
///
/// # Errors
///
/// Returns [`ShardError`] if no table can be built for `membership`. Nodes
/// prepared before the failure stay fenced until the next successful call.
pub async fn rebalance(
    nodes: &[Arc<ShardCoordinator>],
    membership: &Membership,
) -> Result<Vec<HandoffPlan>, ShardError> {
    let mut plans = Vec::with_capacity(nodes.len());
    for node in nodes {
        plans.push(node.prepare_membership(membership).await?);
    }
    for node in nodes {
        node.commit_membership().await;
    }
    Ok(plans)
}
