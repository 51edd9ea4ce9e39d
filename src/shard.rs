//! Shard placement: key hashing, cluster membership, and the shard table.
//!
//! Entity keys hash into a fixed number of virtual shards. Each shard is
//! owned by exactly one node, chosen by rendezvous hashing over the current
//! membership, so a membership change only moves the shards whose top-ranked
//! node changed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::event::{EntityKey, StreamId};

const FNV_OFFSET: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;

/// FNV-1a over `parts`, with a `0xff` separator between parts.
///
/// Stable across processes and platforms, unlike `std`'s `DefaultHasher`.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut hash = FNV_OFFSET;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hash ^= 0xff;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        for byte in part.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Shard an aggregate instance lives in.
pub fn shard_for(aggregate_type: &str, key: &EntityKey, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    (stable_hash(&[aggregate_type, key.as_str()]) % u64::from(shard_count)) as u32
}

/// Shard of a stream.
pub fn shard_of(stream: &StreamId, shard_count: u32) -> u32 {
    shard_for(&stream.aggregate_type, &stream.key, shard_count)
}

/// Rendezvous weight of `node` for `shard`.
fn weight(shard: u32, node: &str) -> u64 {
    // FNV alone clusters on short, similar inputs; finish with splitmix64.
    let mut z = stable_hash(&[&shard.to_string(), node]);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// The set of nodes currently in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    nodes: BTreeSet<String>,
}

impl Membership {
    /// Build a membership from node ids.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::EmptyNodeId`] if any id is blank.
    pub fn new<I, S>(nodes: I) -> Result<Self, ShardError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut membership = Self::default();
        for node in nodes {
            membership.add(node)?;
        }
        Ok(membership)
    }

    /// Add a node. Adding a present node is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::EmptyNodeId`] if the id is blank.
    pub fn add(&mut self, node_id: impl Into<String>) -> Result<(), ShardError> {
        let node_id = node_id.into();
        if node_id.trim().is_empty() {
            return Err(ShardError::EmptyNodeId);
        }
        self.nodes.insert(node_id);
        Ok(())
    }

    /// Remove a node. Returns `true` if it was present.
    pub fn remove(&mut self, node_id: &str) -> bool {
        self.nodes.remove(node_id)
    }

    /// Returns `true` if `node_id` is a member.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Members in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if there are no members.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Where a command for one entity must run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRoute {
    /// Shard the entity lives in.
    pub shard: u32,
    /// Node that owns the shard.
    pub owner: String,
    /// Epoch of the table the route was computed from.
    pub epoch: u64,
    /// `true` if the computing node is the owner.
    pub local: bool,
}

/// A shard whose owner changes between two tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMove {
    /// The shard.
    pub shard: u32,
    /// Owner in the old table.
    pub from: String,
    /// Owner in the new table.
    pub to: String,
}

/// Shard-to-owner assignment for one membership epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTable {
    epoch: u64,
    owners: Vec<String>,
}

impl ShardTable {
    /// Assign every shard to its highest-weight member.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::ZeroShards`] or [`ShardError::EmptyMembership`]
    /// when no assignment is possible.
    pub fn compute(
        membership: &Membership,
        shard_count: u32,
        epoch: u64,
    ) -> Result<Self, ShardError> {
        if shard_count == 0 {
            return Err(ShardError::ZeroShards);
        }
        if membership.is_empty() {
            return Err(ShardError::EmptyMembership);
        }
        let mut owners = Vec::with_capacity(shard_count as usize);
        for shard in 0..shard_count {
            let mut best: Option<(u64, &str)> = None;
            for node in membership.nodes() {
                let w = weight(shard, node);
                // Ties break towards the smaller node id; nodes() is sorted.
                if best.is_none_or(|(bw, _)| w > bw) {
                    best = Some((w, node));
                }
            }
            if let Some((_, node)) = best {
                owners.push(node.to_owned());
            }
        }
        Ok(Self { epoch, owners })
    }

    /// Epoch this table was computed for. Strictly increases with every
    /// membership change applied by a coordinator.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Owner of `shard`, if it is in range.
    pub fn owner(&self, shard: u32) -> Option<&str> {
        self.owners.get(shard as usize).map(String::as_str)
    }

    /// Route for `stream` as seen from `local_node`.
    pub fn route(&self, stream: &StreamId, local_node: &str) -> ShardRoute {
        let shard = shard_of(stream, self.shard_count());
        let owner = self.owner(shard).unwrap_or_default().to_owned();
        ShardRoute {
            shard,
            local: owner == local_node,
            owner,
            epoch: self.epoch,
        }
    }

    /// Shards owned by `node`.
    pub fn shards_owned_by(&self, node: &str) -> Vec<u32> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_str() == node)
            .map(|(shard, _)| shard as u32)
            .collect()
    }

    /// Shards whose owner differs in `next`.
    pub fn moves_to(&self, next: &ShardTable) -> Vec<ShardMove> {
        self.owners
            .iter()
            .zip(&next.owners)
            .enumerate()
            .filter(|(_, (from, to))| from != to)
            .map(|(shard, (from, to))| ShardMove {
                shard: shard as u32,
                from: from.clone(),
                to: to.clone(),
            })
            .collect()
    }
}
