//! Configuration verification.
//!
//! `verify` re-derives the expected state of every service from the
//! persisted topology and parameters, queries the live agents, and reports
//! every discrepancy as a [`Problem`]. Problems are plain values recomputed
//! on each call; nothing is cached between runs. An agent that cannot be
//! reached is itself a violation, and every resource it hosts is reported
//! as unverifiable through it.

use crate::agent::AgentRegistry;
use crate::error::Result;
use crate::topology::{Parameters, Topology};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

/// Closed set of discrepancy categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemKind {
    /// Topology places a replica that the agent has never deployed.
    MissingReplica,
    /// Deployed but not running.
    StoppedReplica,
    /// The storage node's agent did not answer.
    UnreachableAgent,
    /// Parameter record without a topology entry.
    OrphanedParameters,
    /// Topology entry without a parameter record.
    OrphanedTopologyEntry,
    /// Agent-side helper hosts differ from the derived list.
    ParameterMismatch,
    /// Admin type disagrees with its hosting zone's type.
    AdminTypeMismatch,
    /// Storage node hosts fewer electable replicas than its capacity.
    UnderCapacity,
    /// Fewer primary admins than a fault-tolerant quorum wants.
    InsufficientAdmins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Violation,
    Warning,
}

/// One discrepancy between expected and observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub kind: ProblemKind,
    pub resource: ResourceId,
    pub severity: Severity,
    pub description: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on {}: {}", self.kind, self.resource, self.description)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Compare topology placements against live agent state.
    pub check_topology: bool,
    /// Compare stored parameters against agent-side parameters.
    pub check_params: bool,
    /// Include warnings (capacity, admin count), not just violations.
    pub list_all: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            check_topology: true,
            check_params: true,
            list_all: true,
        }
    }
}

/// Verification outcome for one topology sequence.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub topology_sequence: u64,
    pub problems: Vec<Problem>,
}

impl VerifyReport {
    pub fn violations(&self) -> impl Iterator<Item = &Problem> {
        self.problems
            .iter()
            .filter(|p| p.severity == Severity::Violation)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Problem> {
        self.problems
            .iter()
            .filter(|p| p.severity == Severity::Warning)
    }

    pub fn violation_count(&self) -> usize {
        self.violations().count()
    }

    pub fn is_clean(&self) -> bool {
        self.violation_count() == 0
    }

    fn push(
        &mut self,
        kind: ProblemKind,
        resource: ResourceId,
        severity: Severity,
        description: String,
    ) {
        self.problems.push(Problem {
            kind,
            resource,
            severity,
            description,
        });
    }
}

pub struct Verifier {
    agents: AgentRegistry,
}

impl Verifier {
    pub fn new(agents: AgentRegistry) -> Self {
        Self { agents }
    }

    /// Compare persisted topology/parameters against live agent state.
    pub async fn verify(
        &self,
        topo: &Topology,
        params: &Parameters,
        options: VerifyOptions,
    ) -> Result<VerifyReport> {
        let mut report = VerifyReport {
            topology_sequence: topo.sequence(),
            problems: Vec::new(),
        };

        let unreachable = self.probe_agents(topo, &mut report).await;

        if options.check_topology {
            self.check_replicas(topo, &unreachable, &mut report).await;
            self.check_admins(topo, &unreachable, &mut report).await;
        }
        if options.check_params {
            self.check_parameters(topo, params, &unreachable, &mut report)
                .await;
        }
        if options.list_all {
            self.check_warnings(topo, &mut report);
        }

        info!(
            sequence = topo.sequence(),
            violations = report.violation_count(),
            warnings = report.warnings().count(),
            "verification complete"
        );
        Ok(report)
    }

    /// Ping every storage node once; an unreachable agent is a violation
    /// and masks per-resource checks on that host.
    async fn probe_agents(
        &self,
        topo: &Topology,
        report: &mut VerifyReport,
    ) -> BTreeSet<StorageNodeId> {
        let mut unreachable = BTreeSet::new();
        for sn in topo.storage_nodes().keys() {
            if !self.agents.is_reachable(*sn).await {
                unreachable.insert(*sn);
                report.push(
                    ProblemKind::UnreachableAgent,
                    ResourceId::StorageNode(*sn),
                    Severity::Violation,
                    format!("agent on {} did not respond", sn),
                );
            }
        }
        unreachable
    }

    async fn check_replicas(
        &self,
        topo: &Topology,
        unreachable: &BTreeSet<StorageNodeId>,
        report: &mut VerifyReport,
    ) {
        for shard in topo.shards() {
            for member in topo.shard_members(shard) {
                let sn = match topo.replica_host(member) {
                    Some(sn) => sn,
                    None => continue,
                };
                let resource = match member {
                    ReplicaId::Rn(rn) => ResourceId::RepNode(rn),
                    ReplicaId::An(an) => ResourceId::ArbNode(an),
                };
                if unreachable.contains(&sn) {
                    report.push(
                        ProblemKind::UnreachableAgent,
                        resource,
                        Severity::Violation,
                        format!("{} cannot be verified: agent on {} is down", member, sn),
                    );
                    continue;
                }
                let status = match self.status_of(sn, member).await {
                    Some(status) => status,
                    None => continue,
                };
                debug!(%member, %sn, ?status, "verified replica");
                match status {
                    ServiceStatus::Running => {}
                    ServiceStatus::NotDeployed => report.push(
                        ProblemKind::MissingReplica,
                        resource,
                        Severity::Violation,
                        format!("{} is placed on {} but not deployed", member, sn),
                    ),
                    ServiceStatus::Stopped => report.push(
                        ProblemKind::StoppedReplica,
                        resource,
                        Severity::Violation,
                        format!("{} is deployed on {} but not running", member, sn),
                    ),
                    ServiceStatus::Unreachable => report.push(
                        ProblemKind::StoppedReplica,
                        resource,
                        Severity::Violation,
                        format!("{} on {} is not answering", member, sn),
                    ),
                }
            }
        }
    }

    async fn check_admins(
        &self,
        topo: &Topology,
        unreachable: &BTreeSet<StorageNodeId>,
        report: &mut VerifyReport,
    ) {
        for admin in topo.admins().values() {
            let resource = ResourceId::Admin(admin.id);
            if unreachable.contains(&admin.storage_node) {
                report.push(
                    ProblemKind::UnreachableAgent,
                    resource,
                    Severity::Violation,
                    format!(
                        "{} cannot be verified: agent on {} is down",
                        admin.id, admin.storage_node
                    ),
                );
                continue;
            }
            let agent = match self.agents.agent(admin.storage_node).await {
                Ok(agent) => agent,
                Err(_) => continue,
            };
            match agent.admin_status(admin.id).await {
                Ok(Some((status, observed_type))) => {
                    if status != ServiceStatus::Running {
                        report.push(
                            ProblemKind::StoppedReplica,
                            resource,
                            Severity::Violation,
                            format!("{} is deployed but not running", admin.id),
                        );
                    }
                    let expected = topo
                        .zone_of_storage_node(admin.storage_node)
                        .map(|z| z.zone_type)
                        .unwrap_or(admin.admin_type);
                    if observed_type != expected {
                        report.push(
                            ProblemKind::AdminTypeMismatch,
                            resource,
                            Severity::Violation,
                            format!(
                                "{} reports type {:?}, zone expects {:?}",
                                admin.id, observed_type, expected
                            ),
                        );
                    }
                }
                Ok(None) => report.push(
                    ProblemKind::MissingReplica,
                    resource,
                    Severity::Violation,
                    format!(
                        "{} is placed on {} but not deployed",
                        admin.id, admin.storage_node
                    ),
                ),
                Err(_) => report.push(
                    ProblemKind::UnreachableAgent,
                    resource,
                    Severity::Violation,
                    format!("status query for {} failed", admin.id),
                ),
            }
        }
    }

    async fn check_parameters(
        &self,
        topo: &Topology,
        params: &Parameters,
        unreachable: &BTreeSet<StorageNodeId>,
        report: &mut VerifyReport,
    ) {
        // Orphans in either direction.
        for id in params.replica_ids() {
            if topo.replica_host(id).is_none() {
                report.push(
                    ProblemKind::OrphanedParameters,
                    resource_of(id),
                    Severity::Violation,
                    format!("{} has parameters but no topology entry", id),
                );
            }
        }
        for shard in topo.shards() {
            for member in topo.shard_members(shard) {
                if params.replica(member).is_none() {
                    report.push(
                        ProblemKind::OrphanedTopologyEntry,
                        resource_of(member),
                        Severity::Violation,
                        format!("{} is in the topology but has no parameters", member),
                    );
                }
            }
        }
        for (id, _) in params.admin_params() {
            if topo.admin(*id).is_none() {
                report.push(
                    ProblemKind::OrphanedParameters,
                    ResourceId::Admin(*id),
                    Severity::Violation,
                    format!("{} has parameters but no topology entry", id),
                );
            }
        }
        for admin in topo.admins().values() {
            if params.admin(admin.id).is_none() {
                report.push(
                    ProblemKind::OrphanedTopologyEntry,
                    ResourceId::Admin(admin.id),
                    Severity::Violation,
                    format!("{} is in the topology but has no parameters", admin.id),
                );
            }
        }

        // Agent-side helper hosts must match the derived list.
        for shard in topo.shards() {
            for member in topo.shard_members(shard) {
                let sn = match topo.replica_host(member) {
                    Some(sn) if !unreachable.contains(&sn) => sn,
                    _ => continue,
                };
                let agent = match self.agents.agent(sn).await {
                    Ok(agent) => agent,
                    Err(_) => continue,
                };
                let stored = match agent.get_parameters(member).await {
                    Ok(Some(hosts)) => hosts,
                    Ok(None) => continue, // missing deploy already reported
                    Err(_) => continue,
                };
                let expected = topo.derive_helper_hosts(member);
                if stored != expected {
                    report.push(
                        ProblemKind::ParameterMismatch,
                        resource_of(member),
                        Severity::Violation,
                        format!(
                            "{} helper hosts are {:?}, expected {:?}",
                            member, stored, expected
                        ),
                    );
                }
            }
        }
    }

    fn check_warnings(&self, topo: &Topology, report: &mut VerifyReport) {
        for (sn, node) in topo.storage_nodes() {
            let in_use = topo.capacity_in_use(*sn);
            if in_use < node.capacity {
                report.push(
                    ProblemKind::UnderCapacity,
                    ResourceId::StorageNode(*sn),
                    Severity::Warning,
                    format!(
                        "{} hosts {} electable replicas, capacity {}",
                        sn, in_use, node.capacity
                    ),
                );
            }
        }

        let primary_admins = topo
            .admins()
            .values()
            .filter(|a| a.admin_type == ZoneType::Primary)
            .count();
        let wanted = (topo.primary_rep_factor() as usize).min(3);
        let primary_zone = topo
            .zones()
            .values()
            .find(|z| z.zone_type == ZoneType::Primary);
        if let Some(zone) = primary_zone {
            if primary_admins < wanted {
                report.push(
                    ProblemKind::InsufficientAdmins,
                    ResourceId::Zone(zone.id),
                    Severity::Warning,
                    format!(
                        "{} primary admins deployed, {} recommended",
                        primary_admins, wanted
                    ),
                );
            }
        }
    }

    async fn status_of(&self, sn: StorageNodeId, id: ReplicaId) -> Option<ServiceStatus> {
        let agent = self.agents.agent(sn).await.ok()?;
        agent.status(id).await.ok()
    }
}

fn resource_of(id: ReplicaId) -> ResourceId {
    match id {
        ReplicaId::Rn(rn) => ResourceId::RepNode(rn),
        ReplicaId::An(an) => ResourceId::ArbNode(an),
    }
}
