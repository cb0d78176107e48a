//! Structural diff between the deployed topology and a candidate.
//!
//! `diff` is a pure function of its two inputs. It validates the candidate
//! statically (so bad plans fail at creation time, before any remote call)
//! and orders the resulting changes so availability is preserved at every
//! intermediate step:
//!
//! - zone promotions (SECONDARY to PRIMARY) come before any demotion, so the
//!   overall primary replication factor never transiently drops;
//! - deploys come before relocations, relocations before removals;
//! - relocations within one shard are serialized; relocations in distinct
//!   shards may run in parallel;
//! - shard removal comes last, after its partitions have been reassigned.

use super::{AdminReplica, ArbNode, RepNode, Shard, Topology};
use crate::error::{LatticeError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One structural change against the deployed topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopoChange {
    PromoteZone {
        zone: ZoneId,
    },
    DemoteZone {
        zone: ZoneId,
    },
    ChangeAdminType {
        admin: AdminId,
        new_type: ZoneType,
    },
    CreateShard {
        shard: ShardId,
    },
    RemoveShard {
        shard: ShardId,
    },
    DeployRepNode {
        id: RepNodeId,
        sn: StorageNodeId,
    },
    RelocateRepNode {
        id: RepNodeId,
        from: StorageNodeId,
        to: StorageNodeId,
    },
    RemoveRepNode {
        id: RepNodeId,
        sn: StorageNodeId,
    },
    DeployArbNode {
        id: ArbNodeId,
        sn: StorageNodeId,
    },
    RelocateArbNode {
        id: ArbNodeId,
        from: StorageNodeId,
        to: StorageNodeId,
    },
    RemoveArbNode {
        id: ArbNodeId,
        sn: StorageNodeId,
    },
    DeployAdmin {
        id: AdminId,
        sn: StorageNodeId,
    },
    RemoveAdmin {
        id: AdminId,
        sn: StorageNodeId,
    },
    CreatePartition {
        partition: PartitionId,
        shard: ShardId,
    },
    AssignPartition {
        partition: PartitionId,
        from: ShardId,
        to: ShardId,
    },
}

impl TopoChange {
    /// The shard whose availability this change can affect, if any.
    pub fn shard(&self) -> Option<ShardId> {
        match self {
            TopoChange::CreateShard { shard } | TopoChange::RemoveShard { shard } => Some(*shard),
            TopoChange::DeployRepNode { id, .. }
            | TopoChange::RelocateRepNode { id, .. }
            | TopoChange::RemoveRepNode { id, .. } => Some(id.shard),
            TopoChange::DeployArbNode { id, .. }
            | TopoChange::RelocateArbNode { id, .. }
            | TopoChange::RemoveArbNode { id, .. } => Some(id.shard),
            TopoChange::CreatePartition { shard, .. } => Some(*shard),
            TopoChange::AssignPartition { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// A set of changes that may execute concurrently: no two members affect
/// the same shard's availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeGroup {
    pub changes: Vec<TopoChange>,
}

/// The ordered output of a diff. Groups execute in order; changes within a
/// group may be run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedChangeSet {
    /// Sequence of the deployed topology the diff was computed against.
    pub base_sequence: u64,
    pub groups: Vec<ChangeGroup>,
}

impl OrderedChangeSet {
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.changes.is_empty())
    }

    pub fn change_count(&self) -> usize {
        self.groups.iter().map(|g| g.changes.len()).sum()
    }

    /// Shards any change in the set touches, for plan-overlap serialization.
    pub fn affected_shards(&self) -> BTreeSet<ShardId> {
        self.groups
            .iter()
            .flat_map(|g| g.changes.iter())
            .filter_map(|c| c.shard())
            .collect()
    }

    /// Zones whose type this set changes.
    pub fn affected_zones(&self) -> BTreeSet<ZoneId> {
        self.groups
            .iter()
            .flat_map(|g| g.changes.iter())
            .filter_map(|c| match c {
                TopoChange::PromoteZone { zone } | TopoChange::DemoteZone { zone } => Some(*zone),
                _ => None,
            })
            .collect()
    }
}

/// Static validation of a candidate against the deployed topology.
fn validate(deployed: &Topology, candidate: &Topology) -> Result<()> {
    let invariant_problems = candidate.check_invariants();
    if let Some(problem) = invariant_problems.first() {
        return Err(LatticeError::Validation(format!(
            "candidate violates topology invariants: {}",
            problem
        )));
    }

    if candidate.shard_count() == 0 {
        return Err(LatticeError::Validation(
            "candidate has zero shards".into(),
        ));
    }
    if candidate.partitions().is_empty() {
        return Err(LatticeError::Validation(
            "candidate has zero partitions".into(),
        ));
    }

    for zone in candidate.zones().values() {
        if zone.rep_factor < 1 {
            return Err(LatticeError::Validation(format!(
                "zone {} replication factor below 1",
                zone.id
            )));
        }
    }

    // Capacity: every electable placement must fit its host.
    for (sn, node) in candidate.storage_nodes() {
        let in_use = candidate.capacity_in_use(*sn);
        if in_use > node.capacity {
            return Err(LatticeError::Validation(format!(
                "storage node {} is over capacity: {} electable replicas, capacity {}",
                sn, in_use, node.capacity
            )));
        }
    }

    // Arbiters only in zones that allow them.
    for an in candidate.arb_nodes().values() {
        let allowed = candidate
            .zone_of_storage_node(an.storage_node)
            .map(|z| z.allow_arbiters)
            .unwrap_or(false);
        if !allowed {
            return Err(LatticeError::Validation(format!(
                "{} is hosted in a zone that does not allow arbiters",
                an.id
            )));
        }
    }

    // Zone-type transition check: the overall primary replication factor
    // must support a majority for the admin group and every shard.
    let old_rf = deployed.primary_rep_factor();
    let new_rf = candidate.primary_rep_factor();
    if new_rf == 0 {
        return Err(LatticeError::Validation(format!(
            "this would reduce the overall primary replication factor by {} from {} to {}",
            old_rf - new_rf,
            old_rf,
            new_rf
        )));
    }

    Ok(())
}

/// Compute the ordered change set that turns `deployed` into `candidate`.
pub fn diff(deployed: &Topology, candidate: &Topology) -> Result<OrderedChangeSet> {
    validate(deployed, candidate)?;

    let mut promotions = Vec::new();
    let mut demotions = Vec::new();
    for (zone_id, zone) in candidate.zones() {
        let old_type = deployed.zone(*zone_id).map(|z| z.zone_type);
        match (old_type, zone.zone_type) {
            (Some(ZoneType::Secondary), ZoneType::Primary) => {
                promotions.push(TopoChange::PromoteZone { zone: *zone_id });
            }
            (Some(ZoneType::Primary), ZoneType::Secondary) => {
                demotions.push(TopoChange::DemoteZone { zone: *zone_id });
            }
            _ => {}
        }
    }

    let mut admin_type_changes = Vec::new();
    for (id, admin) in candidate.admins() {
        if let Some(old) = deployed.admin(*id) {
            if old.admin_type != admin.admin_type {
                admin_type_changes.push(TopoChange::ChangeAdminType {
                    admin: *id,
                    new_type: admin.admin_type,
                });
            }
        }
    }

    let deployed_shards: BTreeSet<ShardId> = deployed.shards().collect();
    let candidate_shards: BTreeSet<ShardId> = candidate.shards().collect();

    let shard_creates: Vec<TopoChange> = candidate_shards
        .difference(&deployed_shards)
        .map(|shard| TopoChange::CreateShard { shard: *shard })
        .collect();
    let shard_removes: Vec<TopoChange> = deployed_shards
        .difference(&candidate_shards)
        .map(|shard| TopoChange::RemoveShard { shard: *shard })
        .collect();

    let mut deploys = Vec::new();
    let mut relocations: BTreeMap<ShardId, Vec<TopoChange>> = BTreeMap::new();
    let mut removals: BTreeMap<ShardId, Vec<TopoChange>> = BTreeMap::new();

    for (id, rn) in candidate.rep_nodes() {
        match deployed.rep_node(*id) {
            None => deploys.push(TopoChange::DeployRepNode {
                id: *id,
                sn: rn.storage_node,
            }),
            Some(old) if old.storage_node != rn.storage_node => {
                relocations
                    .entry(id.shard)
                    .or_default()
                    .push(TopoChange::RelocateRepNode {
                        id: *id,
                        from: old.storage_node,
                        to: rn.storage_node,
                    });
            }
            Some(_) => {}
        }
    }
    for (id, old) in deployed.rep_nodes() {
        if candidate.rep_node(*id).is_none() {
            removals
                .entry(id.shard)
                .or_default()
                .push(TopoChange::RemoveRepNode {
                    id: *id,
                    sn: old.storage_node,
                });
        }
    }

    for (id, an) in candidate.arb_nodes() {
        match deployed.arb_node(*id) {
            None => deploys.push(TopoChange::DeployArbNode {
                id: *id,
                sn: an.storage_node,
            }),
            Some(old) if old.storage_node != an.storage_node => {
                relocations
                    .entry(id.shard)
                    .or_default()
                    .push(TopoChange::RelocateArbNode {
                        id: *id,
                        from: old.storage_node,
                        to: an.storage_node,
                    });
            }
            Some(_) => {}
        }
    }
    for (id, old) in deployed.arb_nodes() {
        if candidate.arb_node(*id).is_none() {
            removals
                .entry(id.shard)
                .or_default()
                .push(TopoChange::RemoveArbNode {
                    id: *id,
                    sn: old.storage_node,
                });
        }
    }

    let mut admin_deploys = Vec::new();
    let mut admin_removes = Vec::new();
    for (id, admin) in candidate.admins() {
        if deployed.admin(*id).is_none() {
            admin_deploys.push(TopoChange::DeployAdmin {
                id: *id,
                sn: admin.storage_node,
            });
        }
    }
    for (id, old) in deployed.admins() {
        if candidate.admin(*id).is_none() {
            admin_removes.push(TopoChange::RemoveAdmin {
                id: *id,
                sn: old.storage_node,
            });
        }
    }

    let mut partition_creates = Vec::new();
    let mut partition_moves = Vec::new();
    for (partition, to) in candidate.partitions() {
        match deployed.partitions().get(partition) {
            Some(from) if from != to => partition_moves.push(TopoChange::AssignPartition {
                partition: *partition,
                from: *from,
                to: *to,
            }),
            Some(_) => {}
            None => partition_creates.push(TopoChange::CreatePartition {
                partition: *partition,
                shard: *to,
            }),
        }
    }

    let mut groups: Vec<ChangeGroup> = Vec::new();
    let mut push_group = |changes: Vec<TopoChange>| {
        if !changes.is_empty() {
            groups.push(ChangeGroup { changes });
        }
    };

    // Promotions strictly first so the primary RF never transiently dips.
    push_group(promotions);
    push_group(shard_creates);
    push_group(partition_creates);
    push_group(deploys);
    push_group(admin_deploys);

    // Relocation rounds: the i-th relocation of every shard runs in round i;
    // a shard never has two members in flight at once.
    let max_rounds = relocations.values().map(|v| v.len()).max().unwrap_or(0);
    for round in 0..max_rounds {
        let changes: Vec<TopoChange> = relocations
            .values()
            .filter_map(|moves| moves.get(round).cloned())
            .collect();
        push_group(changes);
    }

    push_group(partition_moves);

    // Removals after every relocation in the same shard has settled.
    let max_removal_rounds = removals.values().map(|v| v.len()).max().unwrap_or(0);
    for round in 0..max_removal_rounds {
        let changes: Vec<TopoChange> = removals
            .values()
            .filter_map(|removes| removes.get(round).cloned())
            .collect();
        push_group(changes);
    }

    push_group(admin_removes);
    push_group(shard_removes);
    push_group(admin_type_changes);
    push_group(demotions);

    Ok(OrderedChangeSet {
        base_sequence: deployed.sequence(),
        groups,
    })
}

impl Topology {
    /// Apply one change to this (deployed) topology.
    ///
    /// Idempotent: a change that is already reflected returns `Ok(false)`
    /// without bumping the sequence, so task replay can re-run freely. A
    /// change whose source state neither matches the expected `from` nor the
    /// target is an inconsistency.
    pub fn apply_change(&mut self, change: &TopoChange) -> Result<bool> {
        match change {
            TopoChange::PromoteZone { zone } => self.apply_zone_type(*zone, ZoneType::Primary),
            TopoChange::DemoteZone { zone } => self.apply_zone_type(*zone, ZoneType::Secondary),
            TopoChange::ChangeAdminType { admin, new_type } => {
                let record = self.admins.get_mut(admin).ok_or_else(|| {
                    LatticeError::Inconsistency(format!("unknown admin {}", admin))
                })?;
                if record.admin_type == *new_type {
                    return Ok(false);
                }
                record.admin_type = *new_type;
                self.bump();
                Ok(true)
            }
            TopoChange::CreateShard { shard } => {
                if self.shards.contains_key(shard) {
                    return Ok(false);
                }
                self.shards.insert(
                    *shard,
                    Shard {
                        id: *shard,
                        next_node_num: 1,
                        next_arb_num: 1,
                    },
                );
                self.next_shard = self.next_shard.max(shard.0 + 1);
                self.bump();
                Ok(true)
            }
            TopoChange::RemoveShard { shard } => {
                if !self.shards.contains_key(shard) {
                    return Ok(false);
                }
                self.remove_shard(*shard)?;
                Ok(true)
            }
            TopoChange::DeployRepNode { id, sn } => {
                if let Some(existing) = self.rep_nodes.get(id) {
                    return self.check_already_placed(existing.storage_node, *sn, *id);
                }
                let slot = self.shards.get_mut(&id.shard).ok_or_else(|| {
                    LatticeError::Inconsistency(format!("unknown shard {}", id.shard))
                })?;
                slot.next_node_num = slot.next_node_num.max(id.node_num + 1);
                self.rep_nodes.insert(
                    *id,
                    RepNode {
                        id: *id,
                        storage_node: *sn,
                    },
                );
                self.bump();
                Ok(true)
            }
            TopoChange::RelocateRepNode { id, from, to } => {
                let record = self.rep_nodes.get_mut(id).ok_or_else(|| {
                    LatticeError::Inconsistency(format!("unknown rep node {}", id))
                })?;
                if record.storage_node == *to {
                    return Ok(false);
                }
                if record.storage_node != *from {
                    return Err(LatticeError::Inconsistency(format!(
                        "{} is on {}, expected {}",
                        id, record.storage_node, from
                    )));
                }
                record.storage_node = *to;
                self.bump();
                Ok(true)
            }
            TopoChange::RemoveRepNode { id, .. } => {
                if self.rep_nodes.remove(id).is_none() {
                    return Ok(false);
                }
                self.bump();
                Ok(true)
            }
            TopoChange::DeployArbNode { id, sn } => {
                if let Some(existing) = self.arb_nodes.get(id) {
                    return self.check_already_placed(existing.storage_node, *sn, *id);
                }
                let slot = self.shards.get_mut(&id.shard).ok_or_else(|| {
                    LatticeError::Inconsistency(format!("unknown shard {}", id.shard))
                })?;
                slot.next_arb_num = slot.next_arb_num.max(id.node_num + 1);
                self.arb_nodes.insert(
                    *id,
                    ArbNode {
                        id: *id,
                        storage_node: *sn,
                    },
                );
                self.bump();
                Ok(true)
            }
            TopoChange::RelocateArbNode { id, from, to } => {
                let record = self.arb_nodes.get_mut(id).ok_or_else(|| {
                    LatticeError::Inconsistency(format!("unknown arb node {}", id))
                })?;
                if record.storage_node == *to {
                    return Ok(false);
                }
                if record.storage_node != *from {
                    return Err(LatticeError::Inconsistency(format!(
                        "{} is on {}, expected {}",
                        id, record.storage_node, from
                    )));
                }
                record.storage_node = *to;
                self.bump();
                Ok(true)
            }
            TopoChange::RemoveArbNode { id, .. } => {
                if self.arb_nodes.remove(id).is_none() {
                    return Ok(false);
                }
                self.bump();
                Ok(true)
            }
            TopoChange::DeployAdmin { id, sn } => {
                if let Some(existing) = self.admins.get(id) {
                    return self.check_already_placed(existing.storage_node, *sn, *id);
                }
                let admin_type = self
                    .zone_of_storage_node(*sn)
                    .map(|z| z.zone_type)
                    .ok_or_else(|| {
                        LatticeError::Inconsistency(format!("unknown storage node {}", sn))
                    })?;
                self.admins.insert(
                    *id,
                    AdminReplica {
                        id: *id,
                        storage_node: *sn,
                        admin_type,
                    },
                );
                self.next_admin = self.next_admin.max(id.0 + 1);
                self.bump();
                Ok(true)
            }
            TopoChange::RemoveAdmin { id, .. } => {
                if self.admins.remove(id).is_none() {
                    return Ok(false);
                }
                self.bump();
                Ok(true)
            }
            TopoChange::CreatePartition { partition, shard } => {
                if self.partitions.contains_key(partition) {
                    return Ok(false);
                }
                if !self.shards.contains_key(shard) {
                    return Err(LatticeError::Inconsistency(format!(
                        "unknown shard {}",
                        shard
                    )));
                }
                self.partitions.insert(*partition, *shard);
                self.bump();
                Ok(true)
            }
            TopoChange::AssignPartition { partition, to, .. } => {
                if !self.shards.contains_key(to) {
                    return Err(LatticeError::Inconsistency(format!("unknown shard {}", to)));
                }
                let current = self.partitions.get_mut(partition).ok_or_else(|| {
                    LatticeError::Inconsistency(format!("unknown partition {}", partition))
                })?;
                if *current == *to {
                    return Ok(false);
                }
                *current = *to;
                self.bump();
                Ok(true)
            }
        }
    }

    fn check_already_placed(
        &self,
        existing: StorageNodeId,
        wanted: StorageNodeId,
        id: impl std::fmt::Display,
    ) -> Result<bool> {
        if existing == wanted {
            Ok(false)
        } else {
            Err(LatticeError::Inconsistency(format!(
                "{} already placed on {}, expected {}",
                id, existing, wanted
            )))
        }
    }

    fn apply_zone_type(&mut self, zone: ZoneId, zone_type: ZoneType) -> Result<bool> {
        let record = self
            .zones
            .get_mut(&zone)
            .ok_or_else(|| LatticeError::Inconsistency(format!("unknown zone {}", zone)))?;
        if record.zone_type == zone_type {
            return Ok(false);
        }
        record.zone_type = zone_type;
        self.bump();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{PlacementParams, StorageNodePool, TopologyBuilder};

    fn deployed_store() -> (Topology, StorageNodePool) {
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 3, ZoneType::Primary, false).unwrap();
        let mut pool = StorageNodePool::new("pool1");
        for i in 0..4 {
            let sn = topo
                .add_storage_node(zone, format!("host{}:5000", i + 1), 1)
                .unwrap();
            pool.members.insert(sn);
        }
        let builder = TopologyBuilder::new(&topo, &pool);
        let deployed = builder
            .build_initial(PlacementParams { partitions: 9 })
            .unwrap();
        (deployed, pool)
    }

    #[test]
    fn test_diff_initial_deploy() {
        let mut empty = Topology::new();
        let zone = empty.add_zone("zn1", 3, ZoneType::Primary, false).unwrap();
        let mut pool = StorageNodePool::new("pool1");
        for i in 0..3 {
            let sn = empty
                .add_storage_node(zone, format!("h{}:1", i + 1), 1)
                .unwrap();
            pool.members.insert(sn);
        }
        let candidate = TopologyBuilder::new(&empty, &pool)
            .build_initial(PlacementParams { partitions: 6 })
            .unwrap();

        let set = diff(&empty, &candidate).unwrap();
        assert!(!set.is_empty());
        assert_eq!(set.base_sequence, empty.sequence());

        let creates = set
            .groups
            .iter()
            .flat_map(|g| &g.changes)
            .filter(|c| matches!(c, TopoChange::CreateShard { .. }))
            .count();
        let rn_deploys = set
            .groups
            .iter()
            .flat_map(|g| &g.changes)
            .filter(|c| matches!(c, TopoChange::DeployRepNode { .. }))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(rn_deploys, 3);
    }

    #[test]
    fn test_diff_noop() {
        let (deployed, _) = deployed_store();
        let set = diff(&deployed, &deployed.clone()).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_diff_minimal_movement_on_move() {
        let (deployed, pool) = deployed_store();
        let rn = RepNodeId::new(ShardId(1), 1);
        let candidate = TopologyBuilder::new(&deployed, &pool)
            .move_replica(rn, None)
            .unwrap();

        let set = diff(&deployed, &candidate).unwrap();
        assert_eq!(set.change_count(), 1);
        match &set.groups[0].changes[0] {
            TopoChange::RelocateRepNode { id, from, to } => {
                assert_eq!(*id, rn);
                assert_ne!(from, to);
            }
            other => panic!("expected relocation, got {:?}", other),
        }
    }

    #[test]
    fn test_same_shard_relocations_serialized() {
        let (deployed, _) = deployed_store();
        // Hand-edit: move two members of shard 1 (onto each other's spare).
        let mut candidate = deployed.clone();
        let rn1 = RepNodeId::new(ShardId(1), 1);
        let rn2 = RepNodeId::new(ShardId(1), 2);
        let spare = candidate
            .storage_nodes()
            .keys()
            .copied()
            .find(|sn| candidate.capacity_in_use(*sn) == 0)
            .unwrap();
        let old1 = candidate.rep_node(rn1).unwrap().storage_node;
        candidate.move_rep_node(rn1, spare).unwrap();
        candidate.move_rep_node(rn2, old1).unwrap();

        let set = diff(&deployed, &candidate).unwrap();
        // Two relocations in the same shard never share a group.
        for group in &set.groups {
            let same_shard_relocs = group
                .changes
                .iter()
                .filter(|c| matches!(c, TopoChange::RelocateRepNode { .. }))
                .count();
            assert!(same_shard_relocs <= 1);
        }
        assert_eq!(set.change_count(), 2);
    }

    #[test]
    fn test_cross_shard_relocations_parallel() {
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 1, ZoneType::Primary, false).unwrap();
        for i in 0..4 {
            topo.add_storage_node(zone, format!("h{}:1", i + 1), 1)
                .unwrap();
        }
        let s1 = topo.add_shard();
        let s2 = topo.add_shard();
        let rn1 = topo.add_rep_node(s1, StorageNodeId(1)).unwrap();
        let rn2 = topo.add_rep_node(s2, StorageNodeId(2)).unwrap();
        topo.create_partitions(4).unwrap();

        let mut candidate = topo.clone();
        candidate.move_rep_node(rn1, StorageNodeId(3)).unwrap();
        candidate.move_rep_node(rn2, StorageNodeId(4)).unwrap();

        let set = diff(&topo, &candidate).unwrap();
        // Distinct shards relocate in the same round.
        let reloc_group = set
            .groups
            .iter()
            .find(|g| {
                g.changes
                    .iter()
                    .any(|c| matches!(c, TopoChange::RelocateRepNode { .. }))
            })
            .unwrap();
        assert_eq!(reloc_group.changes.len(), 2);
    }

    #[test]
    fn test_primary_rf_reduction_to_zero_rejected() {
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 2, ZoneType::Primary, false).unwrap();
        for i in 0..2 {
            topo.add_storage_node(zone, format!("h{}:1", i + 1), 1)
                .unwrap();
        }
        let shard = topo.add_shard();
        topo.add_rep_node(shard, StorageNodeId(1)).unwrap();
        topo.add_rep_node(shard, StorageNodeId(2)).unwrap();
        topo.create_partitions(2).unwrap();

        let mut candidate = topo.clone();
        candidate.set_zone_type(zone, ZoneType::Secondary).unwrap();

        let err = diff(&topo, &candidate).unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("reduce the overall primary replication factor by 2 from 2 to 0"),
            "unexpected message: {}",
            message
        );
    }

    #[test]
    fn test_promotion_ordered_before_demotion() {
        let mut topo = Topology::new();
        let zn1 = topo.add_zone("a", 1, ZoneType::Primary, false).unwrap();
        let zn2 = topo.add_zone("b", 1, ZoneType::Secondary, false).unwrap();
        topo.add_storage_node(zn1, "h1:1", 1).unwrap();
        topo.add_storage_node(zn2, "h2:1", 1).unwrap();
        let shard = topo.add_shard();
        topo.add_rep_node(shard, StorageNodeId(1)).unwrap();
        topo.add_rep_node(shard, StorageNodeId(2)).unwrap();
        topo.create_partitions(2).unwrap();

        let mut candidate = topo.clone();
        candidate.set_zone_type(zn2, ZoneType::Primary).unwrap();
        candidate.set_zone_type(zn1, ZoneType::Secondary).unwrap();

        let set = diff(&topo, &candidate).unwrap();
        let promote_idx = set
            .groups
            .iter()
            .position(|g| {
                g.changes
                    .iter()
                    .any(|c| matches!(c, TopoChange::PromoteZone { .. }))
            })
            .unwrap();
        let demote_idx = set
            .groups
            .iter()
            .position(|g| {
                g.changes
                    .iter()
                    .any(|c| matches!(c, TopoChange::DemoteZone { .. }))
            })
            .unwrap();
        assert!(promote_idx < demote_idx);
    }

    #[test]
    fn test_removals_after_relocations() {
        let (deployed, _) = deployed_store();
        let mut candidate = deployed.clone();
        let rn1 = RepNodeId::new(ShardId(1), 1);
        let spare = candidate
            .storage_nodes()
            .keys()
            .copied()
            .find(|sn| candidate.capacity_in_use(*sn) == 0)
            .unwrap();
        candidate.move_rep_node(rn1, spare).unwrap();
        candidate.remove_rep_node(RepNodeId::new(ShardId(1), 3)).unwrap();

        let set = diff(&deployed, &candidate).unwrap();
        let reloc_idx = set
            .groups
            .iter()
            .position(|g| {
                g.changes
                    .iter()
                    .any(|c| matches!(c, TopoChange::RelocateRepNode { .. }))
            })
            .unwrap();
        let remove_idx = set
            .groups
            .iter()
            .position(|g| {
                g.changes
                    .iter()
                    .any(|c| matches!(c, TopoChange::RemoveRepNode { .. }))
            })
            .unwrap();
        assert!(reloc_idx < remove_idx);
    }

    #[test]
    fn test_apply_change_set_reaches_candidate() {
        let mut empty = Topology::new();
        let zone = empty.add_zone("zn1", 3, ZoneType::Primary, false).unwrap();
        let mut pool = StorageNodePool::new("pool1");
        for i in 0..3 {
            let sn = empty
                .add_storage_node(zone, format!("h{}:1", i + 1), 1)
                .unwrap();
            pool.members.insert(sn);
        }
        let candidate = TopologyBuilder::new(&empty, &pool)
            .build_initial(PlacementParams { partitions: 6 })
            .unwrap();

        let set = diff(&empty, &candidate).unwrap();
        let mut deployed = empty.clone();
        for group in &set.groups {
            for change in &group.changes {
                assert!(deployed.apply_change(change).unwrap());
            }
        }
        assert_eq!(deployed.shard_count(), candidate.shard_count());
        assert_eq!(deployed.rep_nodes(), candidate.rep_nodes());
        assert_eq!(deployed.partitions(), candidate.partitions());
        assert!(deployed.check_invariants().is_empty());
    }

    #[test]
    fn test_apply_change_is_idempotent() {
        let (mut deployed, pool) = deployed_store();
        let rn = RepNodeId::new(ShardId(1), 1);
        let candidate = TopologyBuilder::new(&deployed, &pool)
            .move_replica(rn, None)
            .unwrap();
        let set = diff(&deployed, &candidate).unwrap();
        let change = &set.groups[0].changes[0];

        assert!(deployed.apply_change(change).unwrap());
        let seq = deployed.sequence();
        // Replay is a no-op and does not advance the sequence.
        assert!(!deployed.apply_change(change).unwrap());
        assert_eq!(deployed.sequence(), seq);
    }

    #[test]
    fn test_apply_relocation_from_unexpected_host_is_inconsistency() {
        let (mut deployed, _) = deployed_store();
        let rn = RepNodeId::new(ShardId(1), 1);
        let actual = deployed.rep_node(rn).unwrap().storage_node;
        let wrong = deployed
            .storage_nodes()
            .keys()
            .copied()
            .find(|sn| *sn != actual && deployed.capacity_in_use(*sn) > 0)
            .unwrap();
        let spare = deployed
            .storage_nodes()
            .keys()
            .copied()
            .find(|sn| deployed.capacity_in_use(*sn) == 0)
            .unwrap();

        let err = deployed
            .apply_change(&TopoChange::RelocateRepNode {
                id: rn,
                from: wrong,
                to: spare,
            })
            .unwrap_err();
        assert!(matches!(err, LatticeError::Inconsistency(_)));
    }

    #[test]
    fn test_over_capacity_candidate_rejected() {
        let (deployed, _) = deployed_store();
        let mut candidate = deployed.clone();
        // Force a second replica onto a full host from a different shard.
        let extra = candidate.add_shard();
        candidate.add_rep_node(extra, StorageNodeId(1)).unwrap();

        let err = diff(&deployed, &candidate).unwrap_err();
        assert!(err.to_string().contains("over capacity"));
    }
}
