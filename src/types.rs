//! Core type definitions for the Lattice control plane.
//!
//! This module contains the strongly-typed resource identifiers used as map
//! keys throughout the topology arena, plus the small shared enums (zone
//! types, service status) that every component consumes.
//!
//! # Key Types
//!
//! - [`ZoneId`], [`StorageNodeId`], [`ShardId`], [`AdminId`], [`PartitionId`]:
//!   store-scoped numeric identifiers, never reused after removal
//! - [`RepNodeId`] / [`ArbNodeId`]: shard-scoped replica identifiers
//! - [`ReplicaId`]: either kind of shard member, used by tasks and agents
//! - [`ResourceId`]: any identifiable resource, used by verification problems
//!
//! # Examples
//!
//! ```rust
//! use lattice::types::{RepNodeId, ShardId};
//!
//! let rn = RepNodeId::new(ShardId(2), 1);
//! assert_eq!(rn.to_string(), "rg2-rn1");
//! assert_eq!(rn.shard, ShardId(2));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a zone (datacenter).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ZoneId(pub u32);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zn{}", self.0)
    }
}

/// Unique identifier for a storage node (host).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct StorageNodeId(pub u32);

impl fmt::Display for StorageNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sn{}", self.0)
    }
}

/// Unique identifier for a shard (replication group).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rg{}", self.0)
    }
}

/// Shard-scoped identifier for a data-holding, electable replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepNodeId {
    pub shard: ShardId,
    pub node_num: u32,
}

impl RepNodeId {
    pub fn new(shard: ShardId, node_num: u32) -> Self {
        Self { shard, node_num }
    }
}

impl fmt::Display for RepNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-rn{}", self.shard, self.node_num)
    }
}

/// Shard-scoped identifier for a quorum-only arbiter replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArbNodeId {
    pub shard: ShardId,
    pub node_num: u32,
}

impl ArbNodeId {
    pub fn new(shard: ShardId, node_num: u32) -> Self {
        Self { shard, node_num }
    }
}

impl fmt::Display for ArbNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-an{}", self.shard, self.node_num)
    }
}

/// Unique identifier for an admin (orchestrator) replica.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct AdminId(pub u32);

impl fmt::Display for AdminId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "admin{}", self.0)
    }
}

/// Unique identifier for a partition (key range).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Either kind of shard member. Tasks and agent calls are uniform over
/// electable replicas and arbiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicaId {
    Rn(RepNodeId),
    An(ArbNodeId),
}

impl ReplicaId {
    pub fn shard(&self) -> ShardId {
        match self {
            ReplicaId::Rn(id) => id.shard,
            ReplicaId::An(id) => id.shard,
        }
    }

    /// Whether this member votes with data (electable) or is quorum-only.
    pub fn is_electable(&self) -> bool {
        matches!(self, ReplicaId::Rn(_))
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaId::Rn(id) => write!(f, "{}", id),
            ReplicaId::An(id) => write!(f, "{}", id),
        }
    }
}

impl From<RepNodeId> for ReplicaId {
    fn from(id: RepNodeId) -> Self {
        ReplicaId::Rn(id)
    }
}

impl From<ArbNodeId> for ReplicaId {
    fn from(id: ArbNodeId) -> Self {
        ReplicaId::An(id)
    }
}

/// Any identifiable resource; verification problems point at these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceId {
    Zone(ZoneId),
    StorageNode(StorageNodeId),
    Shard(ShardId),
    RepNode(RepNodeId),
    ArbNode(ArbNodeId),
    Admin(AdminId),
    Partition(PartitionId),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Zone(id) => write!(f, "{}", id),
            ResourceId::StorageNode(id) => write!(f, "{}", id),
            ResourceId::Shard(id) => write!(f, "{}", id),
            ResourceId::RepNode(id) => write!(f, "{}", id),
            ResourceId::ArbNode(id) => write!(f, "{}", id),
            ResourceId::Admin(id) => write!(f, "{}", id),
            ResourceId::Partition(id) => write!(f, "{}", id),
        }
    }
}

impl From<ReplicaId> for ResourceId {
    fn from(id: ReplicaId) -> Self {
        match id {
            ReplicaId::Rn(rn) => ResourceId::RepNode(rn),
            ReplicaId::An(an) => ResourceId::ArbNode(an),
        }
    }
}

/// Zone type. The sum of primary-zone replication factors determines the
/// quorum size required by every shard and by the admin group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneType {
    Primary,
    Secondary,
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneType::Primary => write!(f, "PRIMARY"),
            ZoneType::Secondary => write!(f, "SECONDARY"),
        }
    }
}

/// Status reported by a storage-node agent for a hosted service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceStatus {
    /// Service process is up and serving.
    Running,
    /// Service is deployed but stopped.
    Stopped,
    /// Service was never deployed on this agent.
    NotDeployed,
    /// Agent could not determine status (service hung or mid-restart).
    Unreachable,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceStatus::Running)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running => write!(f, "RUNNING"),
            ServiceStatus::Stopped => write!(f, "STOPPED"),
            ServiceStatus::NotDeployed => write!(f, "NOT_DEPLOYED"),
            ServiceStatus::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Simple majority for a voting-member count.
pub fn majority(members: usize) -> usize {
    members / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(ZoneId(1).to_string(), "zn1");
        assert_eq!(StorageNodeId(3).to_string(), "sn3");
        assert_eq!(RepNodeId::new(ShardId(2), 1).to_string(), "rg2-rn1");
        assert_eq!(ArbNodeId::new(ShardId(1), 1).to_string(), "rg1-an1");
        assert_eq!(AdminId(2).to_string(), "admin2");
    }

    #[test]
    fn test_replica_id() {
        let rn: ReplicaId = RepNodeId::new(ShardId(1), 2).into();
        let an: ReplicaId = ArbNodeId::new(ShardId(1), 1).into();
        assert!(rn.is_electable());
        assert!(!an.is_electable());
        assert_eq!(rn.shard(), ShardId(1));
        assert_eq!(an.shard(), ShardId(1));
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(5), 3);
    }
}
