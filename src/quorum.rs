//! Precondition checks that gate destructive operations.
//!
//! Before any task stops, relocates or removes an electable member or an
//! admin replica, the checker re-queries live status of the affected group
//! and requires that a simple majority can still be formed after the change.
//! Liveness can change between plan creation and execution, so these checks
//! run at execution time, immediately before the destructive step.

use crate::agent::AgentRegistry;
use crate::error::{LatticeError, Result};
use crate::topology::Topology;
use crate::types::*;
use tracing::debug;

/// Live-status quorum checker for shards, zones and the admin group.
#[derive(Clone)]
pub struct QuorumChecker {
    agents: AgentRegistry,
}

impl QuorumChecker {
    pub fn new(agents: AgentRegistry) -> Self {
        Self { agents }
    }

    /// Live voting members of a shard: running electable replicas plus
    /// running arbiters, optionally pretending one member is already down.
    async fn live_voters(
        &self,
        topo: &Topology,
        shard: ShardId,
        excluding: Option<ReplicaId>,
    ) -> usize {
        let mut voters: Vec<(ReplicaId, StorageNodeId)> = Vec::new();
        for rn in topo.shard_electable(shard) {
            if let Some(node) = topo.rep_node(rn) {
                voters.push((ReplicaId::Rn(rn), node.storage_node));
            }
        }
        for an in topo.shard_arb_nodes(shard) {
            voters.push((ReplicaId::An(an.id), an.storage_node));
        }

        let mut live = 0;
        for (id, sn) in voters {
            if excluding == Some(id) {
                continue;
            }
            let running = match self.agents.agent(sn).await {
                Ok(agent) => agent
                    .status(id)
                    .await
                    .map(|s| s.is_running())
                    .unwrap_or(false),
                Err(_) => false,
            };
            if running {
                live += 1;
            }
        }
        live
    }

    /// Is it safe to take one member of `shard` down? Requires a simple
    /// majority of electable members to remain live without it; an arbiter
    /// counts toward quorum formation but its loss never blocks.
    pub async fn check_shard_safe(
        &self,
        topo: &Topology,
        shard: ShardId,
        excluding: Option<ReplicaId>,
    ) -> Result<()> {
        let electable = topo.shard_electable(shard);
        if electable.is_empty() {
            return Err(LatticeError::PreconditionFailed(format!(
                "shard {} has no electable members",
                shard
            )));
        }
        // Arbiters vote but hold no data; stopping one leaves the data
        // replicas intact, so only electable-member loss is gated.
        if let Some(ReplicaId::An(_)) = excluding {
            return Ok(());
        }

        let voters = electable.len() + topo.shard_arb_nodes(shard).len();
        let need = majority(voters);
        let live = self.live_voters(topo, shard, excluding).await;
        debug!(shard = %shard, live, need, "shard quorum precondition");
        if live < need {
            return Err(LatticeError::PreconditionFailed(format!(
                "a simple majority of voting members cannot be formed for shard {}: \
                 {} of {} required members are available",
                shard, live, need
            )));
        }
        Ok(())
    }

    /// Is it safe to change the type of `zone`? A majority of the zone's
    /// storage-node agents must be reachable.
    pub async fn check_zone_safe(&self, topo: &Topology, zone: ZoneId) -> Result<()> {
        let members: Vec<StorageNodeId> = topo
            .storage_nodes()
            .values()
            .filter(|sn| sn.zone == zone)
            .map(|sn| sn.id)
            .collect();
        if members.is_empty() {
            return Err(LatticeError::PreconditionFailed(format!(
                "zone {} has no storage nodes",
                zone
            )));
        }

        let mut reachable = 0;
        for sn in &members {
            if self.agents.is_reachable(*sn).await {
                reachable += 1;
            }
        }
        let need = majority(members.len());
        debug!(zone = %zone, reachable, need, "zone quorum precondition");
        if reachable < need {
            return Err(LatticeError::PreconditionFailed(format!(
                "a majority of nodes in zone {} must be reachable to change its type: \
                 {} of {} reachable",
                zone, reachable, need
            )));
        }
        Ok(())
    }

    /// Is it safe to take one primary admin replica down?
    pub async fn check_admin_safe(
        &self,
        topo: &Topology,
        excluding: Option<AdminId>,
    ) -> Result<()> {
        let primaries: Vec<_> = topo
            .admins()
            .values()
            .filter(|a| a.admin_type == ZoneType::Primary)
            .collect();
        if primaries.is_empty() {
            // No admin group deployed yet; nothing to protect.
            return Ok(());
        }

        let mut live = 0;
        for admin in &primaries {
            if excluding == Some(admin.id) {
                continue;
            }
            let running = match self.agents.agent(admin.storage_node).await {
                Ok(agent) => agent
                    .admin_status(admin.id)
                    .await
                    .ok()
                    .flatten()
                    .map(|(status, _)| status.is_running())
                    .unwrap_or(false),
                Err(_) => false,
            };
            if running {
                live += 1;
            }
        }
        let need = majority(primaries.len());
        if live < need {
            return Err(LatticeError::PreconditionFailed(format!(
                "a simple majority of admin replicas cannot be formed: \
                 {} of {} required replicas are available",
                live, need
            )));
        }
        Ok(())
    }

    /// Every shard must be healthy enough before a store-wide change such
    /// as a zone-type flip proceeds.
    pub async fn check_all_shards_safe(&self, topo: &Topology) -> Result<()> {
        for shard in topo.shards() {
            if let Err(err) = self.check_shard_safe(topo, shard, None).await {
                return Err(LatticeError::PreconditionFailed(format!(
                    "one of the groups is not healthy enough: {}",
                    err
                )));
            }
        }
        Ok(())
    }
}
