//! Candidate construction from placement policy.
//!
//! The builder turns a deployed topology plus a storage-node pool into a new
//! candidate topology for one of the supported layout operations: initial
//! build, rebalance, redistribute, contract, explicit move, zone-type
//! change. Placement is deterministic: targets are chosen least-loaded
//! first with id order as the tie-break, so the same inputs always produce
//! the same candidate.
//!
//! Rules enforced here:
//! - new placements only land on storage nodes with spare capacity (and, for
//!   arbiters, in a zone with the allow-arbiters flag);
//! - at most one electable member per (shard, storage node);
//! - compliant replicas are never moved by rebalance or redistribute.

use super::Topology;
use crate::error::{LatticeError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// A named set of storage nodes available for placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodePool {
    pub name: String,
    pub members: BTreeSet<StorageNodeId>,
}

impl StorageNodePool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
        }
    }

    pub fn with_members(name: impl Into<String>, members: impl IntoIterator<Item = StorageNodeId>) -> Self {
        Self {
            name: name.into(),
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, sn: StorageNodeId) -> bool {
        self.members.contains(&sn)
    }
}

/// Validated placement policy input for candidate construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementParams {
    /// Partition count, fixed for the store lifetime at initial build.
    pub partitions: u32,
}

/// Builds candidate topologies from the deployed topology and a pool.
pub struct TopologyBuilder<'a> {
    deployed: &'a Topology,
    pool: &'a StorageNodePool,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(deployed: &'a Topology, pool: &'a StorageNodePool) -> Self {
        Self { deployed, pool }
    }

    fn validate_pool(&self) -> Result<()> {
        if self.pool.members.is_empty() {
            return Err(LatticeError::Validation(format!(
                "pool {} is empty",
                self.pool.name
            )));
        }
        for sn in &self.pool.members {
            if self.deployed.storage_node(*sn).is_none() {
                return Err(LatticeError::Validation(format!(
                    "pool {} references unknown storage node {}",
                    self.pool.name, sn
                )));
            }
        }
        Ok(())
    }

    /// Number of shards the pool can support: the tightest zone bounds it.
    fn supportable_shards(&self, topo: &Topology) -> u32 {
        topo.zones()
            .values()
            .map(|zone| {
                let capacity: u32 = self
                    .pool
                    .members
                    .iter()
                    .filter_map(|sn| topo.storage_node(*sn))
                    .filter(|node| node.zone == zone.id)
                    .map(|node| node.capacity)
                    .sum();
                if zone.rep_factor == 0 {
                    0
                } else {
                    capacity / zone.rep_factor
                }
            })
            .min()
            .unwrap_or(0)
    }

    /// Pool nodes in a zone with spare capacity, least loaded first.
    fn spare_nodes_in_zone(
        &self,
        topo: &Topology,
        zone: ZoneId,
        exclude: &BTreeSet<StorageNodeId>,
    ) -> Vec<StorageNodeId> {
        let mut nodes: Vec<StorageNodeId> = self
            .pool
            .members
            .iter()
            .copied()
            .filter(|sn| !exclude.contains(sn))
            .filter(|sn| topo.storage_node(*sn).map(|n| n.zone) == Some(zone))
            .filter(|sn| topo.spare_capacity(*sn) > 0)
            .collect();
        nodes.sort_by_key(|sn| (std::cmp::Reverse(topo.spare_capacity(*sn)), *sn));
        nodes
    }

    fn place_shard_rep_nodes(&self, topo: &mut Topology, shard: ShardId) -> Result<()> {
        let zones: Vec<(ZoneId, u32)> = topo
            .zones()
            .values()
            .map(|z| (z.id, z.rep_factor))
            .collect();
        for (zone, rf) in zones {
            let existing = topo
                .shard_rep_nodes(shard)
                .into_iter()
                .filter(|rn| topo.storage_node(rn.storage_node).map(|n| n.zone) == Some(zone))
                .count() as u32;
            for _ in existing..rf {
                // One electable member per (shard, storage node).
                let hosting: BTreeSet<StorageNodeId> = topo
                    .shard_rep_nodes(shard)
                    .into_iter()
                    .map(|rn| rn.storage_node)
                    .collect();
                let target = self
                    .spare_nodes_in_zone(topo, zone, &hosting)
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        LatticeError::Validation(format!(
                            "pool {} does not have enough capacity in zone {} for shard {}",
                            self.pool.name, zone, shard
                        ))
                    })?;
                topo.add_rep_node(shard, target)?;
            }
        }
        Ok(())
    }

    /// Arbiters break ties when the primary replication factor is exactly 2.
    fn place_shard_arbiter(&self, topo: &mut Topology, shard: ShardId) -> Result<()> {
        if topo.primary_rep_factor() != 2 {
            return Ok(());
        }
        if !topo.shard_arb_nodes(shard).is_empty() {
            return Ok(());
        }
        let hosting: BTreeSet<StorageNodeId> = topo
            .shard_members(shard)
            .into_iter()
            .filter_map(|m| topo.replica_host(m))
            .collect();

        // Arbiters are capacity-free, so rank hosts by arbiter count.
        let mut targets: Vec<StorageNodeId> = self
            .pool
            .members
            .iter()
            .copied()
            .filter(|sn| {
                topo.zone_of_storage_node(*sn)
                    .map(|z| z.allow_arbiters)
                    .unwrap_or(false)
            })
            .filter(|sn| !hosting.contains(sn))
            .collect();
        targets.sort_by_key(|sn| {
            let arbiters = topo
                .arb_nodes()
                .values()
                .filter(|an| an.storage_node == *sn)
                .count();
            (arbiters, *sn)
        });

        let target = targets.into_iter().next().ok_or_else(|| {
            LatticeError::Validation(format!(
                "no arbiter-hosting storage node available for shard {}",
                shard
            ))
        })?;
        topo.add_arb_node(shard, target)?;
        Ok(())
    }

    /// Build the initial candidate: shards sized to the pool, replicas per
    /// zone replication factor, one arbiter per shard when primary RF is 2,
    /// and the partition map.
    pub fn build_initial(&self, params: PlacementParams) -> Result<Topology> {
        self.validate_pool()?;
        if params.partitions == 0 {
            return Err(LatticeError::Validation(
                "partition count must be non-zero".into(),
            ));
        }
        let mut topo = self.deployed.clone();
        if topo.shard_count() > 0 {
            return Err(LatticeError::Validation(
                "store already has shards; use rebalance or redistribute".into(),
            ));
        }

        let shards = self.supportable_shards(&topo);
        if shards == 0 {
            return Err(LatticeError::Validation(format!(
                "pool {} does not have enough capacity for one shard",
                self.pool.name
            )));
        }

        for _ in 0..shards {
            let shard = topo.add_shard();
            self.place_shard_rep_nodes(&mut topo, shard)?;
            self.place_shard_arbiter(&mut topo, shard)?;
        }
        topo.create_partitions(params.partitions)?;

        debug!(
            shards,
            partitions = params.partitions,
            "built initial candidate"
        );
        Ok(topo)
    }

    /// Rebalance: move replicas off over-capacity nodes and fill zone RF
    /// deficits. Replicas that are already compliant stay put.
    pub fn rebalance(&self) -> Result<Topology> {
        self.validate_pool()?;
        let mut topo = self.deployed.clone();

        // Fill missing replicas first so freed capacity is not double-used.
        let shard_ids: Vec<ShardId> = topo.shards().collect();
        for shard in &shard_ids {
            self.place_shard_rep_nodes(&mut topo, *shard)?;
            self.place_shard_arbiter(&mut topo, *shard)?;
        }

        // Relieve over-capacity hosts.
        let overloaded: Vec<StorageNodeId> = topo
            .storage_nodes()
            .keys()
            .copied()
            .filter(|sn| topo.capacity_in_use(*sn) > topo.storage_node(*sn).unwrap().capacity)
            .collect();

        for sn in overloaded {
            let zone = match topo.storage_node(sn) {
                Some(node) => node.zone,
                None => continue,
            };
            while topo.capacity_in_use(sn) > topo.storage_node(sn).unwrap().capacity {
                let victim = topo
                    .rep_nodes()
                    .values()
                    .filter(|rn| rn.storage_node == sn)
                    .map(|rn| rn.id)
                    .max()
                    .ok_or_else(|| {
                        LatticeError::Internal(format!("over-capacity node {} hosts nothing", sn))
                    })?;
                let exclude: BTreeSet<StorageNodeId> = topo
                    .shard_rep_nodes(victim.shard)
                    .into_iter()
                    .map(|rn| rn.storage_node)
                    .collect();
                let target = self
                    .spare_nodes_in_zone(&topo, zone, &exclude)
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        LatticeError::Validation(format!(
                            "pool {} has no spare capacity in zone {} to relieve {}",
                            self.pool.name, zone, sn
                        ))
                    })?;
                debug!(replica = %victim, from = %sn, to = %target, "rebalance move");
                topo.move_rep_node(victim, target)?;
            }
        }

        Ok(topo)
    }

    /// Redistribute: grow the shard count to what the pool now supports and
    /// level the partition map across all shards. Existing replicas are not
    /// moved.
    pub fn redistribute(&self) -> Result<Topology> {
        self.validate_pool()?;
        let mut topo = self.deployed.clone();
        if topo.shard_count() == 0 {
            return Err(LatticeError::Validation(
                "store has no shards; run an initial deployment first".into(),
            ));
        }
        if topo.partitions().is_empty() {
            return Err(LatticeError::Validation(
                "store has no partitions to redistribute".into(),
            ));
        }

        let target_shards = self.supportable_shards(&topo).max(topo.shard_count() as u32);
        let new_shards = target_shards - topo.shard_count() as u32;
        for _ in 0..new_shards {
            let shard = topo.add_shard();
            self.place_shard_rep_nodes(&mut topo, shard)?;
            self.place_shard_arbiter(&mut topo, shard)?;
        }

        self.level_partitions(&mut topo)?;
        Ok(topo)
    }

    /// Move the minimal number of partitions so every shard holds either
    /// floor or ceil of the average.
    fn level_partitions(&self, topo: &mut Topology) -> Result<()> {
        let shard_ids: Vec<ShardId> = topo.shards().collect();
        let total = topo.partitions().len();
        let base = total / shard_ids.len();
        let remainder = total % shard_ids.len();

        let mut targets: Vec<(ShardId, usize)> = shard_ids
            .iter()
            .enumerate()
            .map(|(i, shard)| (*shard, base + usize::from(i < remainder)))
            .collect();
        targets.sort_by_key(|(shard, _)| *shard);

        let mut surplus: Vec<PartitionId> = Vec::new();
        for (shard, target) in &targets {
            let mut owned = topo.partitions_of_shard(*shard);
            owned.sort();
            while owned.len() > *target {
                surplus.push(owned.pop().expect("len checked"));
            }
        }
        for (shard, target) in &targets {
            let mut count = topo.partitions_of_shard(*shard).len();
            while count < *target {
                let partition = surplus.pop().ok_or_else(|| {
                    LatticeError::Internal("partition leveling lost a partition".into())
                })?;
                topo.assign_partition(partition, *shard)?;
                count += 1;
            }
        }
        Ok(())
    }

    /// Contract: vacate storage nodes outside the pool by relocating their
    /// replicas onto pool nodes, then drop the vacated nodes.
    pub fn contract(&self) -> Result<Topology> {
        self.validate_pool()?;
        let mut topo = self.deployed.clone();

        let leaving: Vec<StorageNodeId> = topo
            .storage_nodes()
            .keys()
            .copied()
            .filter(|sn| !self.pool.contains(*sn))
            .collect();
        if leaving.is_empty() {
            return Err(LatticeError::Validation(format!(
                "pool {} already covers every storage node; nothing to contract",
                self.pool.name
            )));
        }

        for sn in &leaving {
            if topo.admins().values().any(|a| a.storage_node == *sn) {
                return Err(LatticeError::Validation(format!(
                    "storage node {} hosts an admin; move the admin before contracting",
                    sn
                )));
            }
            let zone = topo.storage_node(*sn).expect("listed above").zone;
            for replica in topo.hosted_replicas(*sn) {
                match replica {
                    ReplicaId::Rn(rn) => {
                        let exclude: BTreeSet<StorageNodeId> = topo
                            .shard_rep_nodes(rn.shard)
                            .into_iter()
                            .map(|r| r.storage_node)
                            .collect();
                        let target = self
                            .spare_nodes_in_zone(&topo, zone, &exclude)
                            .into_iter()
                            .next()
                            .ok_or_else(|| {
                                LatticeError::Validation(format!(
                                    "pool {} does not have enough capacity to vacate {}",
                                    self.pool.name, sn
                                ))
                            })?;
                        topo.move_rep_node(rn, target)?;
                    }
                    ReplicaId::An(an) => {
                        let hosting: BTreeSet<StorageNodeId> = topo
                            .shard_members(an.shard)
                            .into_iter()
                            .filter(|m| *m != ReplicaId::An(an))
                            .filter_map(|m| topo.replica_host(m))
                            .collect();
                        let target = self
                            .pool
                            .members
                            .iter()
                            .copied()
                            .filter(|cand| {
                                topo.zone_of_storage_node(*cand)
                                    .map(|z| z.allow_arbiters)
                                    .unwrap_or(false)
                            })
                            .find(|cand| !hosting.contains(cand))
                            .ok_or_else(|| {
                                LatticeError::Validation(format!(
                                    "no arbiter-hosting storage node available to vacate {}",
                                    sn
                                ))
                            })?;
                        topo.move_arb_node(an, target)?;
                    }
                }
            }
        }

        for sn in leaving {
            topo.remove_storage_node(sn)?;
        }
        Ok(topo)
    }

    /// Explicit move of one electable replica, optionally to a chosen host.
    pub fn move_replica(
        &self,
        id: RepNodeId,
        target: Option<StorageNodeId>,
    ) -> Result<Topology> {
        self.validate_pool()?;
        let mut topo = self.deployed.clone();
        let current = topo
            .rep_node(id)
            .ok_or_else(|| LatticeError::Validation(format!("unknown rep node {}", id)))?
            .storage_node;

        let target = match target {
            Some(sn) => {
                if sn == current {
                    return Err(LatticeError::Validation(format!(
                        "cannot move {} onto its own storage node {}",
                        id, sn
                    )));
                }
                if topo.spare_capacity(sn) == 0 {
                    return Err(LatticeError::Validation(format!(
                        "storage node {} has no spare capacity",
                        sn
                    )));
                }
                sn
            }
            None => {
                let zone = topo
                    .zone_of_storage_node(current)
                    .ok_or_else(|| {
                        LatticeError::Validation(format!("unknown storage node {}", current))
                    })?
                    .id;
                let mut exclude: BTreeSet<StorageNodeId> = topo
                    .shard_rep_nodes(id.shard)
                    .into_iter()
                    .map(|rn| rn.storage_node)
                    .collect();
                exclude.insert(current);
                self.spare_nodes_in_zone(&topo, zone, &exclude)
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        LatticeError::Validation(format!(
                            "pool {} has no spare capacity in zone {} for {}",
                            self.pool.name, zone, id
                        ))
                    })?
            }
        };

        topo.move_rep_node(id, target)?;
        Ok(topo)
    }

    /// Zone-type change candidate. Admin replicas hosted in the zone follow
    /// the zone's new type. Whether the change is safe overall is decided by
    /// diff validation against the deployed topology.
    pub fn change_zone_type(&self, zone: ZoneId, new_type: ZoneType) -> Result<Topology> {
        let mut topo = self.deployed.clone();
        let current = topo
            .zone(zone)
            .ok_or_else(|| LatticeError::Validation(format!("unknown zone {}", zone)))?
            .zone_type;
        if current == new_type {
            return Err(LatticeError::Validation(format!(
                "zone {} is already {}",
                zone, new_type
            )));
        }
        topo.set_zone_type(zone, new_type)?;

        let admins: Vec<AdminId> = topo
            .admins()
            .values()
            .filter(|a| {
                topo.zone_of_storage_node(a.storage_node)
                    .map(|z| z.id == zone)
                    .unwrap_or(false)
            })
            .map(|a| a.id)
            .collect();
        for admin in admins {
            topo.set_admin_type(admin, new_type)?;
        }
        Ok(topo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployed_with_pool(nodes: u32, capacity: u32) -> (Topology, StorageNodePool) {
        let mut topo = Topology::new();
        let zone = topo
            .add_zone("zn1", 3, ZoneType::Primary, false)
            .unwrap();
        let mut pool = StorageNodePool::new("pool1");
        for i in 0..nodes {
            let sn = topo
                .add_storage_node(zone, format!("host{}:5000", i + 1), capacity)
                .unwrap();
            pool.members.insert(sn);
        }
        (topo, pool)
    }

    #[test]
    fn test_build_initial_rf3() {
        let (topo, pool) = deployed_with_pool(3, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let candidate = builder
            .build_initial(PlacementParams { partitions: 10 })
            .unwrap();

        assert_eq!(candidate.shard_count(), 1);
        assert_eq!(candidate.rep_nodes().len(), 3);
        assert_eq!(candidate.partitions().len(), 10);
        // Replicas land on distinct hosts.
        let hosts: BTreeSet<_> = candidate
            .rep_nodes()
            .values()
            .map(|rn| rn.storage_node)
            .collect();
        assert_eq!(hosts.len(), 3);
    }

    #[test]
    fn test_build_initial_multiple_shards() {
        let (topo, pool) = deployed_with_pool(3, 2);
        let builder = TopologyBuilder::new(&topo, &pool);
        let candidate = builder
            .build_initial(PlacementParams { partitions: 20 })
            .unwrap();
        assert_eq!(candidate.shard_count(), 2);
        assert_eq!(candidate.rep_nodes().len(), 6);
        assert!(candidate.check_invariants().is_empty());
    }

    #[test]
    fn test_build_initial_zero_partitions() {
        let (topo, pool) = deployed_with_pool(3, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let err = builder
            .build_initial(PlacementParams { partitions: 0 })
            .unwrap_err();
        assert!(err.to_string().contains("partition count"));
    }

    #[test]
    fn test_build_initial_empty_pool() {
        let (topo, _) = deployed_with_pool(3, 1);
        let empty = StorageNodePool::new("empty");
        let builder = TopologyBuilder::new(&topo, &empty);
        let err = builder
            .build_initial(PlacementParams { partitions: 10 })
            .unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn test_build_initial_insufficient_capacity() {
        let (topo, pool) = deployed_with_pool(2, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let err = builder
            .build_initial(PlacementParams { partitions: 10 })
            .unwrap_err();
        assert!(err.to_string().contains("capacity"));
    }

    #[test]
    fn test_arbiter_placed_for_rf2() {
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 2, ZoneType::Primary, true).unwrap();
        let mut pool = StorageNodePool::new("pool1");
        for i in 0..3 {
            let sn = topo
                .add_storage_node(zone, format!("host{}:5000", i + 1), 1)
                .unwrap();
            pool.members.insert(sn);
        }
        let builder = TopologyBuilder::new(&topo, &pool);
        let candidate = builder
            .build_initial(PlacementParams { partitions: 6 })
            .unwrap();
        assert_eq!(candidate.shard_count(), 1);
        assert_eq!(candidate.arb_nodes().len(), 1);
        // Arbiter avoids hosts that carry the shard's data replicas.
        let an = candidate.arb_nodes().values().next().unwrap();
        let data_hosts: BTreeSet<_> = candidate
            .rep_nodes()
            .values()
            .map(|rn| rn.storage_node)
            .collect();
        assert!(!data_hosts.contains(&an.storage_node));
    }

    #[test]
    fn test_rebalance_moves_only_noncompliant() {
        // RF=1 zone, two shards stacked on sn4; sn4 is over capacity.
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 1, ZoneType::Primary, false).unwrap();
        let mut pool = StorageNodePool::new("pool1");
        for i in 0..4 {
            let sn = topo
                .add_storage_node(zone, format!("host{}:5000", i + 1), 1)
                .unwrap();
            pool.members.insert(sn);
        }
        let shard1 = topo.add_shard();
        let shard2 = topo.add_shard();
        topo.add_rep_node(shard1, StorageNodeId(4)).unwrap();
        topo.add_rep_node(shard2, StorageNodeId(4)).unwrap();
        topo.create_partitions(4).unwrap();

        let builder = TopologyBuilder::new(&topo, &pool);
        let candidate = builder.rebalance().unwrap();

        // sn4 relieved to capacity 1; the compliant replica stays put.
        assert_eq!(candidate.capacity_in_use(StorageNodeId(4)), 1);
        assert_eq!(
            candidate
                .rep_node(RepNodeId::new(shard1, 1))
                .unwrap()
                .storage_node,
            StorageNodeId(4)
        );
        assert_ne!(
            candidate
                .rep_node(RepNodeId::new(shard2, 1))
                .unwrap()
                .storage_node,
            StorageNodeId(4)
        );
    }

    #[test]
    fn test_redistribute_grows_shards() {
        let (topo, pool) = deployed_with_pool(3, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let deployed = builder
            .build_initial(PlacementParams { partitions: 12 })
            .unwrap();

        // Double every node's capacity: pool now supports two shards.
        let mut grown = deployed.clone();
        let zone = *grown.zones().keys().next().unwrap();
        let mut pool2 = pool.clone();
        for i in 0..3 {
            let sn = grown
                .add_storage_node(zone, format!("newhost{}:5000", i + 1), 1)
                .unwrap();
            pool2.members.insert(sn);
        }

        let builder = TopologyBuilder::new(&grown, &pool2);
        let candidate = builder.redistribute().unwrap();
        assert_eq!(candidate.shard_count(), 2);
        // Partitions leveled: 6 and 6.
        for shard in candidate.shards().collect::<Vec<_>>() {
            assert_eq!(candidate.partitions_of_shard(shard).len(), 6);
        }
        assert!(candidate.check_invariants().is_empty());
    }

    #[test]
    fn test_contract_vacates_non_pool_nodes() {
        let (topo, pool) = deployed_with_pool(4, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let mut deployed = builder
            .build_initial(PlacementParams { partitions: 9 })
            .unwrap();
        // Ensure sn4 hosts something by moving rg1-rn1 there if empty.
        let rn = RepNodeId::new(ShardId(1), 1);
        if deployed.capacity_in_use(StorageNodeId(4)) == 0 {
            deployed.move_rep_node(rn, StorageNodeId(4)).unwrap();
        }

        let shrunk = StorageNodePool::with_members(
            "shrunk",
            [StorageNodeId(1), StorageNodeId(2), StorageNodeId(3)],
        );
        let builder = TopologyBuilder::new(&deployed, &shrunk);
        let candidate = builder.contract().unwrap();

        assert!(candidate.storage_node(StorageNodeId(4)).is_none());
        assert!(candidate.check_invariants().is_empty());
        assert_eq!(candidate.rep_nodes().len(), 3);
    }

    #[test]
    fn test_move_replica_explicit_target() {
        let (topo, pool) = deployed_with_pool(4, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let deployed = builder
            .build_initial(PlacementParams { partitions: 9 })
            .unwrap();

        let rn = RepNodeId::new(ShardId(1), 1);
        let from = deployed.rep_node(rn).unwrap().storage_node;
        let to = deployed
            .storage_nodes()
            .keys()
            .copied()
            .find(|sn| deployed.spare_capacity(*sn) > 0)
            .unwrap();

        let builder = TopologyBuilder::new(&deployed, &pool);
        let candidate = builder.move_replica(rn, Some(to)).unwrap();
        assert_eq!(candidate.rep_node(rn).unwrap().storage_node, to);
        assert_ne!(from, to);
    }

    #[test]
    fn test_move_replica_onto_self_rejected() {
        let (topo, pool) = deployed_with_pool(3, 1);
        let builder = TopologyBuilder::new(&topo, &pool);
        let deployed = builder
            .build_initial(PlacementParams { partitions: 9 })
            .unwrap();

        let rn = RepNodeId::new(ShardId(1), 1);
        let current = deployed.rep_node(rn).unwrap().storage_node;
        let builder = TopologyBuilder::new(&deployed, &pool);
        let err = builder.move_replica(rn, Some(current)).unwrap_err();
        assert!(err.to_string().contains("own storage node"));
    }

    #[test]
    fn test_change_zone_type_updates_admins() {
        let mut topo = Topology::new();
        let zn1 = topo.add_zone("a", 1, ZoneType::Primary, false).unwrap();
        let zn2 = topo.add_zone("b", 1, ZoneType::Primary, false).unwrap();
        let sn1 = topo.add_storage_node(zn1, "h1:1", 1).unwrap();
        topo.add_storage_node(zn2, "h2:1", 1).unwrap();
        let admin = topo.add_admin(sn1).unwrap();

        let pool = StorageNodePool::with_members("pool1", topo.storage_nodes().keys().copied());
        let builder = TopologyBuilder::new(&topo, &pool);
        let candidate = builder.change_zone_type(zn1, ZoneType::Secondary).unwrap();

        assert_eq!(candidate.zone(zn1).unwrap().zone_type, ZoneType::Secondary);
        assert_eq!(
            candidate.admin(admin).unwrap().admin_type,
            ZoneType::Secondary
        );
        assert_eq!(candidate.primary_rep_factor(), 1);
    }
}
