//! Topology model: the versioned arena describing a deployed store.
//!
//! A [`Topology`] is a snapshot of cluster shape: zones, storage nodes,
//! shards and their replica slots, admin replicas, and the partition map.
//! Cross-references are id lookups into typed maps, never pointers, so the
//! model has no ownership cycles and clones cheaply for read-only snapshots.
//!
//! Every mutation bumps the global sequence number; sequence numbers only
//! increase. The plan engine exclusively owns mutation of the deployed
//! topology during execution; all other components receive clones.
//!
//! [`Parameters`] travels beside the topology: per-replica settings (helper
//! hosts, hosting storage node) that agents need and that the verification
//! engine reconciles against the topology proper.

mod builder;
mod candidate;
mod diff;

pub use builder::{PlacementParams, StorageNodePool, TopologyBuilder};
pub use candidate::{CandidateStore, TopologyCandidate};
pub use diff::{diff, ChangeGroup, OrderedChangeSet, TopoChange};

use crate::error::{LatticeError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A failure domain with its own replication factor and type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub rep_factor: u32,
    pub zone_type: ZoneType,
    pub allow_arbiters: bool,
}

/// A host capable of running replica and admin processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: StorageNodeId,
    pub zone: ZoneId,
    pub host: String,
    /// Number of electable replicas this node may host.
    pub capacity: u32,
}

/// A shard slot record. Tracks the next member number so replica ids are
/// never reused within the store lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    next_node_num: u32,
    next_arb_num: u32,
}

/// A data-holding, electable replica placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepNode {
    pub id: RepNodeId,
    pub storage_node: StorageNodeId,
}

/// A quorum-only arbiter placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbNode {
    pub id: ArbNodeId,
    pub storage_node: StorageNodeId,
}

/// An admin (orchestrator) replica placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminReplica {
    pub id: AdminId,
    pub storage_node: StorageNodeId,
    /// Must match the type of the hosting zone; mismatches are repairable
    /// violations.
    pub admin_type: ZoneType,
}

/// Versioned snapshot of cluster shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    sequence: u64,
    next_zone: u32,
    next_storage_node: u32,
    next_shard: u32,
    next_admin: u32,
    zones: BTreeMap<ZoneId, Zone>,
    storage_nodes: BTreeMap<StorageNodeId, StorageNode>,
    shards: BTreeMap<ShardId, Shard>,
    rep_nodes: BTreeMap<RepNodeId, RepNode>,
    arb_nodes: BTreeMap<ArbNodeId, ArbNode>,
    admins: BTreeMap<AdminId, AdminReplica>,
    partitions: BTreeMap<PartitionId, ShardId>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    /// Create an empty topology at sequence 0.
    pub fn new() -> Self {
        Self {
            sequence: 0,
            next_zone: 1,
            next_storage_node: 1,
            next_shard: 1,
            next_admin: 1,
            zones: BTreeMap::new(),
            storage_nodes: BTreeMap::new(),
            shards: BTreeMap::new(),
            rep_nodes: BTreeMap::new(),
            arb_nodes: BTreeMap::new(),
            admins: BTreeMap::new(),
            partitions: BTreeMap::new(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn bump(&mut self) {
        self.sequence += 1;
    }

    // ---- mutation ----

    pub fn add_zone(
        &mut self,
        name: impl Into<String>,
        rep_factor: u32,
        zone_type: ZoneType,
        allow_arbiters: bool,
    ) -> Result<ZoneId> {
        if rep_factor < 1 {
            return Err(LatticeError::Validation(format!(
                "zone replication factor must be at least 1, got {}",
                rep_factor
            )));
        }
        let id = ZoneId(self.next_zone);
        self.next_zone += 1;
        self.zones.insert(
            id,
            Zone {
                id,
                name: name.into(),
                rep_factor,
                zone_type,
                allow_arbiters,
            },
        );
        self.bump();
        Ok(id)
    }

    pub fn add_storage_node(
        &mut self,
        zone: ZoneId,
        host: impl Into<String>,
        capacity: u32,
    ) -> Result<StorageNodeId> {
        if !self.zones.contains_key(&zone) {
            return Err(LatticeError::Validation(format!("unknown zone {}", zone)));
        }
        let id = StorageNodeId(self.next_storage_node);
        self.next_storage_node += 1;
        self.storage_nodes.insert(
            id,
            StorageNode {
                id,
                zone,
                host: host.into(),
                capacity,
            },
        );
        self.bump();
        Ok(id)
    }

    pub fn remove_storage_node(&mut self, id: StorageNodeId) -> Result<()> {
        if !self.hosted_replicas(id).is_empty() {
            return Err(LatticeError::Validation(format!(
                "storage node {} still hosts replicas",
                id
            )));
        }
        if self.admins.values().any(|a| a.storage_node == id) {
            return Err(LatticeError::Validation(format!(
                "storage node {} still hosts an admin",
                id
            )));
        }
        self.storage_nodes
            .remove(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown storage node {}", id)))?;
        self.bump();
        Ok(())
    }

    pub fn add_shard(&mut self) -> ShardId {
        let id = ShardId(self.next_shard);
        self.next_shard += 1;
        self.shards.insert(
            id,
            Shard {
                id,
                next_node_num: 1,
                next_arb_num: 1,
            },
        );
        self.bump();
        id
    }

    pub fn remove_shard(&mut self, id: ShardId) -> Result<()> {
        if !self.shard_members(id).is_empty() {
            return Err(LatticeError::Validation(format!(
                "shard {} still has members",
                id
            )));
        }
        if self.partitions.values().any(|s| *s == id) {
            return Err(LatticeError::Validation(format!(
                "shard {} still owns partitions",
                id
            )));
        }
        self.shards
            .remove(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown shard {}", id)))?;
        self.bump();
        Ok(())
    }

    pub fn add_rep_node(&mut self, shard: ShardId, sn: StorageNodeId) -> Result<RepNodeId> {
        self.check_member_target(shard, sn)?;
        if self
            .rep_nodes
            .values()
            .any(|rn| rn.id.shard == shard && rn.storage_node == sn)
        {
            return Err(LatticeError::Validation(format!(
                "shard {} already has an electable member on {}",
                shard, sn
            )));
        }
        let slot = self.shards.get_mut(&shard).expect("checked above");
        let id = RepNodeId::new(shard, slot.next_node_num);
        slot.next_node_num += 1;
        self.rep_nodes.insert(
            id,
            RepNode {
                id,
                storage_node: sn,
            },
        );
        self.bump();
        Ok(id)
    }

    pub fn add_arb_node(&mut self, shard: ShardId, sn: StorageNodeId) -> Result<ArbNodeId> {
        self.check_member_target(shard, sn)?;
        let zone = self.zone_of_storage_node(sn).expect("checked above");
        if !zone.allow_arbiters {
            return Err(LatticeError::Validation(format!(
                "zone {} does not allow arbiters",
                zone.id
            )));
        }
        let slot = self.shards.get_mut(&shard).expect("checked above");
        let id = ArbNodeId::new(shard, slot.next_arb_num);
        slot.next_arb_num += 1;
        self.arb_nodes.insert(
            id,
            ArbNode {
                id,
                storage_node: sn,
            },
        );
        self.bump();
        Ok(id)
    }

    fn check_member_target(&self, shard: ShardId, sn: StorageNodeId) -> Result<()> {
        if !self.shards.contains_key(&shard) {
            return Err(LatticeError::Validation(format!("unknown shard {}", shard)));
        }
        if !self.storage_nodes.contains_key(&sn) {
            return Err(LatticeError::Validation(format!(
                "unknown storage node {}",
                sn
            )));
        }
        Ok(())
    }

    /// Move an electable replica to a new host. The replica id is stable
    /// across relocation.
    pub fn move_rep_node(&mut self, id: RepNodeId, to: StorageNodeId) -> Result<()> {
        if !self.storage_nodes.contains_key(&to) {
            return Err(LatticeError::Validation(format!(
                "unknown storage node {}",
                to
            )));
        }
        let current = self
            .rep_nodes
            .get(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown rep node {}", id)))?
            .storage_node;
        if current == to {
            return Err(LatticeError::Validation(format!(
                "cannot move {} onto its own storage node {}",
                id, to
            )));
        }
        if self
            .rep_nodes
            .values()
            .any(|rn| rn.id.shard == id.shard && rn.id != id && rn.storage_node == to)
        {
            return Err(LatticeError::Validation(format!(
                "shard {} already has an electable member on {}",
                id.shard, to
            )));
        }
        self.rep_nodes.get_mut(&id).expect("present").storage_node = to;
        self.bump();
        Ok(())
    }

    pub fn move_arb_node(&mut self, id: ArbNodeId, to: StorageNodeId) -> Result<()> {
        if !self.storage_nodes.contains_key(&to) {
            return Err(LatticeError::Validation(format!(
                "unknown storage node {}",
                to
            )));
        }
        let current = self
            .arb_nodes
            .get(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown arb node {}", id)))?
            .storage_node;
        if current == to {
            return Err(LatticeError::Validation(format!(
                "cannot move {} onto its own storage node {}",
                id, to
            )));
        }
        self.arb_nodes.get_mut(&id).expect("present").storage_node = to;
        self.bump();
        Ok(())
    }

    pub fn remove_rep_node(&mut self, id: RepNodeId) -> Result<()> {
        self.rep_nodes
            .remove(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown rep node {}", id)))?;
        self.bump();
        Ok(())
    }

    pub fn remove_arb_node(&mut self, id: ArbNodeId) -> Result<()> {
        self.arb_nodes
            .remove(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown arb node {}", id)))?;
        self.bump();
        Ok(())
    }

    pub fn add_admin(&mut self, sn: StorageNodeId) -> Result<AdminId> {
        let zone = self
            .zone_of_storage_node(sn)
            .ok_or_else(|| LatticeError::Validation(format!("unknown storage node {}", sn)))?;
        let admin_type = zone.zone_type;
        let id = AdminId(self.next_admin);
        self.next_admin += 1;
        self.admins.insert(
            id,
            AdminReplica {
                id,
                storage_node: sn,
                admin_type,
            },
        );
        self.bump();
        Ok(id)
    }

    pub fn remove_admin(&mut self, id: AdminId) -> Result<()> {
        self.admins
            .remove(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown admin {}", id)))?;
        self.bump();
        Ok(())
    }

    pub fn set_admin_type(&mut self, id: AdminId, admin_type: ZoneType) -> Result<()> {
        let admin = self
            .admins
            .get_mut(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown admin {}", id)))?;
        admin.admin_type = admin_type;
        self.bump();
        Ok(())
    }

    pub fn set_zone_type(&mut self, id: ZoneId, zone_type: ZoneType) -> Result<()> {
        let zone = self
            .zones
            .get_mut(&id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown zone {}", id)))?;
        zone.zone_type = zone_type;
        self.bump();
        Ok(())
    }

    /// Create `count` partitions distributed round-robin over current shards.
    pub fn create_partitions(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(LatticeError::Validation(
                "partition count must be non-zero".into(),
            ));
        }
        if self.shards.is_empty() {
            return Err(LatticeError::Validation(
                "cannot create partitions without shards".into(),
            ));
        }
        let shard_ids: Vec<ShardId> = self.shards.keys().copied().collect();
        for i in 0..count {
            let shard = shard_ids[i as usize % shard_ids.len()];
            self.partitions.insert(PartitionId(i + 1), shard);
        }
        self.bump();
        Ok(())
    }

    pub fn assign_partition(&mut self, partition: PartitionId, shard: ShardId) -> Result<()> {
        if !self.shards.contains_key(&shard) {
            return Err(LatticeError::Validation(format!("unknown shard {}", shard)));
        }
        if !self.partitions.contains_key(&partition) {
            return Err(LatticeError::Validation(format!(
                "unknown partition {}",
                partition
            )));
        }
        self.partitions.insert(partition, shard);
        self.bump();
        Ok(())
    }

    // ---- queries ----

    pub fn zones(&self) -> &BTreeMap<ZoneId, Zone> {
        &self.zones
    }

    pub fn storage_nodes(&self) -> &BTreeMap<StorageNodeId, StorageNode> {
        &self.storage_nodes
    }

    pub fn shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.shards.keys().copied()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn rep_nodes(&self) -> &BTreeMap<RepNodeId, RepNode> {
        &self.rep_nodes
    }

    pub fn arb_nodes(&self) -> &BTreeMap<ArbNodeId, ArbNode> {
        &self.arb_nodes
    }

    pub fn admins(&self) -> &BTreeMap<AdminId, AdminReplica> {
        &self.admins
    }

    pub fn partitions(&self) -> &BTreeMap<PartitionId, ShardId> {
        &self.partitions
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(&id)
    }

    pub fn storage_node(&self, id: StorageNodeId) -> Option<&StorageNode> {
        self.storage_nodes.get(&id)
    }

    pub fn rep_node(&self, id: RepNodeId) -> Option<&RepNode> {
        self.rep_nodes.get(&id)
    }

    pub fn arb_node(&self, id: ArbNodeId) -> Option<&ArbNode> {
        self.arb_nodes.get(&id)
    }

    pub fn admin(&self, id: AdminId) -> Option<&AdminReplica> {
        self.admins.get(&id)
    }

    pub fn has_shard(&self, id: ShardId) -> bool {
        self.shards.contains_key(&id)
    }

    pub fn zone_of_storage_node(&self, sn: StorageNodeId) -> Option<&Zone> {
        self.storage_nodes
            .get(&sn)
            .and_then(|node| self.zones.get(&node.zone))
    }

    /// Location of any shard member or None if it is not placed.
    pub fn replica_host(&self, id: ReplicaId) -> Option<StorageNodeId> {
        match id {
            ReplicaId::Rn(rn) => self.rep_nodes.get(&rn).map(|r| r.storage_node),
            ReplicaId::An(an) => self.arb_nodes.get(&an).map(|a| a.storage_node),
        }
    }

    /// Sum of replication factors across primary zones: the quorum basis
    /// for every shard and the admin group.
    pub fn primary_rep_factor(&self) -> u32 {
        self.zones
            .values()
            .filter(|z| z.zone_type == ZoneType::Primary)
            .map(|z| z.rep_factor)
            .sum()
    }

    /// Total replication factor across all zones.
    pub fn total_rep_factor(&self) -> u32 {
        self.zones.values().map(|z| z.rep_factor).sum()
    }

    pub fn shard_rep_nodes(&self, shard: ShardId) -> Vec<RepNode> {
        self.rep_nodes
            .values()
            .filter(|rn| rn.id.shard == shard)
            .copied()
            .collect()
    }

    pub fn shard_arb_nodes(&self, shard: ShardId) -> Vec<ArbNode> {
        self.arb_nodes
            .values()
            .filter(|an| an.id.shard == shard)
            .copied()
            .collect()
    }

    pub fn shard_members(&self, shard: ShardId) -> Vec<ReplicaId> {
        let mut members: Vec<ReplicaId> = self
            .shard_rep_nodes(shard)
            .into_iter()
            .map(|rn| ReplicaId::Rn(rn.id))
            .collect();
        members.extend(
            self.shard_arb_nodes(shard)
                .into_iter()
                .map(|an| ReplicaId::An(an.id)),
        );
        members
    }

    /// Electable members of a shard whose host is in a primary zone.
    pub fn shard_electable(&self, shard: ShardId) -> Vec<RepNodeId> {
        self.shard_rep_nodes(shard)
            .into_iter()
            .filter(|rn| {
                self.zone_of_storage_node(rn.storage_node)
                    .map(|z| z.zone_type == ZoneType::Primary)
                    .unwrap_or(false)
            })
            .map(|rn| rn.id)
            .collect()
    }

    /// Every replica hosted by a storage node.
    pub fn hosted_replicas(&self, sn: StorageNodeId) -> Vec<ReplicaId> {
        let mut hosted: Vec<ReplicaId> = self
            .rep_nodes
            .values()
            .filter(|rn| rn.storage_node == sn)
            .map(|rn| ReplicaId::Rn(rn.id))
            .collect();
        hosted.extend(
            self.arb_nodes
                .values()
                .filter(|an| an.storage_node == sn)
                .map(|an| ReplicaId::An(an.id)),
        );
        hosted
    }

    /// Electable-replica count on a storage node. Arbiters are
    /// capacity-free.
    pub fn capacity_in_use(&self, sn: StorageNodeId) -> u32 {
        self.rep_nodes
            .values()
            .filter(|rn| rn.storage_node == sn)
            .count() as u32
    }

    pub fn spare_capacity(&self, sn: StorageNodeId) -> u32 {
        let capacity = self.storage_nodes.get(&sn).map(|n| n.capacity).unwrap_or(0);
        capacity.saturating_sub(self.capacity_in_use(sn))
    }

    pub fn partitions_of_shard(&self, shard: ShardId) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|(_, s)| **s == shard)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Helper hosts for a shard member: the agent addresses of every other
    /// member of the same shard.
    pub fn derive_helper_hosts(&self, id: ReplicaId) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .shard_members(id.shard())
            .into_iter()
            .filter(|m| *m != id)
            .filter_map(|m| self.replica_host(m))
            .filter_map(|sn| self.storage_nodes.get(&sn))
            .map(|n| n.host.clone())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Structural invariant check. Returns a description per violation.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for rn in self.rep_nodes.values() {
            if !self.storage_nodes.contains_key(&rn.storage_node) {
                problems.push(format!(
                    "{} references missing storage node {}",
                    rn.id, rn.storage_node
                ));
            }
            if !self.shards.contains_key(&rn.id.shard) {
                problems.push(format!("{} references missing shard {}", rn.id, rn.id.shard));
            }
        }
        for an in self.arb_nodes.values() {
            if !self.storage_nodes.contains_key(&an.storage_node) {
                problems.push(format!(
                    "{} references missing storage node {}",
                    an.id, an.storage_node
                ));
            }
        }
        for admin in self.admins.values() {
            if !self.storage_nodes.contains_key(&admin.storage_node) {
                problems.push(format!(
                    "{} references missing storage node {}",
                    admin.id, admin.storage_node
                ));
            }
        }
        for (partition, shard) in &self.partitions {
            if !self.shards.contains_key(shard) {
                problems.push(format!("{} maps to missing shard {}", partition, shard));
            }
        }
        for sn in self.storage_nodes.values() {
            if !self.zones.contains_key(&sn.zone) {
                problems.push(format!("{} references missing zone {}", sn.id, sn.zone));
            }
        }

        // One electable member per (shard, storage node).
        let mut seen = BTreeSet::new();
        for rn in self.rep_nodes.values() {
            if !seen.insert((rn.id.shard, rn.storage_node)) {
                problems.push(format!(
                    "shard {} has multiple electable members on {}",
                    rn.id.shard, rn.storage_node
                ));
            }
        }

        problems
    }
}

/// Per-replica parameters a storage-node agent needs, persisted beside the
/// topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeParams {
    pub storage_node: StorageNodeId,
    pub helper_hosts: Vec<String>,
}

/// Admin replica parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminParams {
    pub storage_node: StorageNodeId,
    pub admin_type: ZoneType,
}

/// Parameter map for every deployed service, sequence-numbered like the
/// topology itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Parameters {
    sequence: u64,
    rep_nodes: BTreeMap<RepNodeId, NodeParams>,
    arb_nodes: BTreeMap<ArbNodeId, NodeParams>,
    admins: BTreeMap<AdminId, AdminParams>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn bump(&mut self) {
        self.sequence += 1;
    }

    pub fn set_replica(&mut self, id: ReplicaId, params: NodeParams) {
        match id {
            ReplicaId::Rn(rn) => {
                self.rep_nodes.insert(rn, params);
            }
            ReplicaId::An(an) => {
                self.arb_nodes.insert(an, params);
            }
        }
        self.bump();
    }

    pub fn remove_replica(&mut self, id: ReplicaId) -> bool {
        let removed = match id {
            ReplicaId::Rn(rn) => self.rep_nodes.remove(&rn).is_some(),
            ReplicaId::An(an) => self.arb_nodes.remove(&an).is_some(),
        };
        if removed {
            self.bump();
        }
        removed
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&NodeParams> {
        match id {
            ReplicaId::Rn(rn) => self.rep_nodes.get(&rn),
            ReplicaId::An(an) => self.arb_nodes.get(&an),
        }
    }

    pub fn set_admin(&mut self, id: AdminId, params: AdminParams) {
        self.admins.insert(id, params);
        self.bump();
    }

    pub fn remove_admin(&mut self, id: AdminId) -> bool {
        let removed = self.admins.remove(&id).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    pub fn admin(&self, id: AdminId) -> Option<&AdminParams> {
        self.admins.get(&id)
    }

    pub fn rep_node_params(&self) -> &BTreeMap<RepNodeId, NodeParams> {
        &self.rep_nodes
    }

    pub fn arb_node_params(&self) -> &BTreeMap<ArbNodeId, NodeParams> {
        &self.arb_nodes
    }

    pub fn admin_params(&self) -> &BTreeMap<AdminId, AdminParams> {
        &self.admins
    }

    /// All replica ids with a parameter entry.
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.rep_nodes.keys().map(|rn| ReplicaId::Rn(*rn)).collect();
        ids.extend(self.arb_nodes.keys().map(|an| ReplicaId::An(*an)));
        ids
    }
}
