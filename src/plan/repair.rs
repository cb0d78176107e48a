//! Repair plans: corrective tasks synthesized from live state.
//!
//! A repair plan is built from a fresh verification report plus the
//! persisted topology and parameters, never from the record of whatever
//! plan failed. The persisted topology is the source of truth: services it
//! places are completed forward, records it does not know are removed.

use super::task::{Task, TaskKind, TaskStage};
use crate::topology::{Parameters, TopoChange, Topology};
use crate::types::*;
use crate::verify::{ProblemKind, VerifyReport};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Expand a verification report into the task stages of a repair plan.
///
/// Problems on unreachable agents are skipped: nothing can be fixed there
/// until the agent answers again. Warnings never produce tasks.
pub fn build_repair_tasks(
    topo: &Topology,
    params: &Parameters,
    report: &VerifyReport,
) -> Vec<TaskStage> {
    let unreachable: BTreeSet<StorageNodeId> = report
        .violations()
        .filter_map(|p| match (p.kind, p.resource) {
            (ProblemKind::UnreachableAgent, ResourceId::StorageNode(sn)) => Some(sn),
            _ => None,
        })
        .collect();

    // One serial branch of corrective steps per broken resource.
    let mut branches: BTreeMap<ResourceId, Vec<TaskKind>> = BTreeMap::new();
    // Helper-host refreshes batched per shard, after everything else.
    let mut refresh_shards: BTreeSet<ShardId> = BTreeSet::new();

    for problem in report.violations() {
        let steps = branches.entry(problem.resource).or_default();
        match (problem.kind, problem.resource) {
            (ProblemKind::MissingReplica, resource) => {
                if let Some(id) = replica_of(resource) {
                    if let Some(sn) = topo.replica_host(id) {
                        if unreachable.contains(&sn) {
                            continue;
                        }
                        push_unique(steps, TaskKind::WriteReplicaParams { id, sn });
                        push_unique(steps, TaskKind::DeployReplica { id, sn });
                        push_unique(steps, TaskKind::StartReplica { id, sn });
                        refresh_shards.insert(id.shard());
                    }
                } else if let ResourceId::Admin(id) = resource {
                    if let Some(admin) = topo.admin(id) {
                        if unreachable.contains(&admin.storage_node) {
                            continue;
                        }
                        push_unique(steps, TaskKind::WriteAdminParams { id });
                        push_unique(
                            steps,
                            TaskKind::DeployAdminService {
                                id,
                                sn: admin.storage_node,
                            },
                        );
                    }
                }
            }
            (ProblemKind::StoppedReplica, resource) => {
                if let Some(id) = replica_of(resource) {
                    if let Some(sn) = topo.replica_host(id) {
                        if unreachable.contains(&sn) {
                            continue;
                        }
                        push_unique(steps, TaskKind::StartReplica { id, sn });
                    }
                }
                // A stopped admin restarts through its own deploy call.
                if let ResourceId::Admin(id) = resource {
                    if let Some(admin) = topo.admin(id) {
                        if unreachable.contains(&admin.storage_node) {
                            continue;
                        }
                        push_unique(
                            steps,
                            TaskKind::DeployAdminService {
                                id,
                                sn: admin.storage_node,
                            },
                        );
                    }
                }
            }
            (ProblemKind::OrphanedParameters, resource) => {
                if let Some(id) = replica_of(resource) {
                    push_unique(steps, TaskKind::RemoveReplicaParams { id });
                } else if let ResourceId::Admin(id) = resource {
                    push_unique(steps, TaskKind::RemoveAdminParams { id });
                }
            }
            (ProblemKind::OrphanedTopologyEntry, resource) => {
                // Topology wins: re-create the missing parameter record.
                if let Some(id) = replica_of(resource) {
                    if let Some(sn) = topo.replica_host(id) {
                        push_unique(steps, TaskKind::WriteReplicaParams { id, sn });
                    }
                } else if let ResourceId::Admin(id) = resource {
                    push_unique(steps, TaskKind::WriteAdminParams { id });
                }
            }
            (ProblemKind::ParameterMismatch, resource) => {
                if let Some(id) = replica_of(resource) {
                    refresh_shards.insert(id.shard());
                }
            }
            (ProblemKind::AdminTypeMismatch, ResourceId::Admin(id)) => {
                if let Some(admin) = topo.admin(id) {
                    if unreachable.contains(&admin.storage_node) {
                        continue;
                    }
                    let expected = topo
                        .zone_of_storage_node(admin.storage_node)
                        .map(|z| z.zone_type)
                        .unwrap_or(admin.admin_type);
                    if admin.admin_type != expected {
                        push_unique(
                            steps,
                            TaskKind::WriteTopoChange {
                                change: TopoChange::ChangeAdminType {
                                    admin: id,
                                    new_type: expected,
                                },
                            },
                        );
                    }
                    push_unique(steps, TaskKind::WriteAdminParams { id });
                    push_unique(
                        steps,
                        TaskKind::SetAdminType {
                            id,
                            admin_type: expected,
                        },
                    );
                }
            }
            // Unreachable agents and anything unexpected: no corrective
            // action exists.
            _ => {}
        }
    }

    // Drop params-store records for replicas the topology no longer knows,
    // discovered through the params side rather than the report.
    for id in params.replica_ids() {
        if topo.replica_host(id).is_none() {
            let steps = branches.entry(resource_of(id)).or_default();
            push_unique(steps, TaskKind::RemoveReplicaParams { id });
        }
    }

    let mut ids = 0u32;
    let mut next = |kind: TaskKind| {
        ids += 1;
        Task { id: ids, kind }
    };

    let mut stages = Vec::new();
    let repair_branches: Vec<Vec<Task>> = branches
        .into_values()
        .filter(|steps| !steps.is_empty())
        .map(|steps| steps.into_iter().map(&mut next).collect())
        .collect();
    if !repair_branches.is_empty() {
        stages.push(TaskStage {
            branches: repair_branches,
        });
    }

    if !refresh_shards.is_empty() {
        let branches: Vec<Vec<Task>> = refresh_shards
            .into_iter()
            .map(|shard| vec![next(TaskKind::RefreshHelperHosts { shard })])
            .collect();
        stages.push(TaskStage { branches });
    }

    debug!(
        stages = stages.len(),
        tasks = stages.iter().map(|s| s.task_count()).sum::<usize>(),
        "repair tasks built"
    );
    stages
}

fn push_unique(steps: &mut Vec<TaskKind>, kind: TaskKind) {
    if !steps.contains(&kind) {
        steps.push(kind);
    }
}

fn replica_of(resource: ResourceId) -> Option<ReplicaId> {
    match resource {
        ResourceId::RepNode(rn) => Some(ReplicaId::Rn(rn)),
        ResourceId::ArbNode(an) => Some(ReplicaId::An(an)),
        _ => None,
    }
}

fn resource_of(id: ReplicaId) -> ResourceId {
    match id {
        ReplicaId::Rn(rn) => ResourceId::RepNode(rn),
        ReplicaId::An(an) => ResourceId::ArbNode(an),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{Problem, Severity};

    fn report_with(problems: Vec<Problem>) -> VerifyReport {
        VerifyReport {
            topology_sequence: 1,
            problems,
        }
    }

    fn small_topo() -> Topology {
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 2, ZoneType::Primary, false).unwrap();
        topo.add_storage_node(zone, "h1:1", 1).unwrap();
        topo.add_storage_node(zone, "h2:1", 1).unwrap();
        let shard = topo.add_shard();
        topo.add_rep_node(shard, StorageNodeId(1)).unwrap();
        topo.add_rep_node(shard, StorageNodeId(2)).unwrap();
        topo.create_partitions(2).unwrap();
        topo
    }

    #[test]
    fn test_stopped_replica_gets_start_task() {
        let topo = small_topo();
        let rn = RepNodeId::new(ShardId(1), 1);
        let report = report_with(vec![Problem {
            kind: ProblemKind::StoppedReplica,
            resource: ResourceId::RepNode(rn),
            severity: Severity::Violation,
            description: String::new(),
        }]);

        let stages = build_repair_tasks(&topo, &Parameters::new(), &report);
        assert_eq!(stages.len(), 1);
        let branch = &stages[0].branches[0];
        assert_eq!(branch.len(), 1);
        assert!(matches!(
            branch[0].kind,
            TaskKind::StartReplica {
                id: ReplicaId::Rn(id),
                sn: StorageNodeId(1),
            } if id == rn
        ));
    }

    #[test]
    fn test_unreachable_host_suppresses_repair() {
        let topo = small_topo();
        let rn = RepNodeId::new(ShardId(1), 1);
        let report = report_with(vec![
            Problem {
                kind: ProblemKind::UnreachableAgent,
                resource: ResourceId::StorageNode(StorageNodeId(1)),
                severity: Severity::Violation,
                description: String::new(),
            },
            Problem {
                kind: ProblemKind::MissingReplica,
                resource: ResourceId::RepNode(rn),
                severity: Severity::Violation,
                description: String::new(),
            },
        ]);

        let stages = build_repair_tasks(&topo, &Parameters::new(), &report);
        // No task may target the dead host.
        for stage in &stages {
            for branch in &stage.branches {
                for task in branch {
                    assert!(
                        !matches!(task.kind, TaskKind::DeployReplica { sn, .. } if sn == StorageNodeId(1))
                    );
                }
            }
        }
    }

    #[test]
    fn test_orphaned_params_removed() {
        let topo = small_topo();
        // A params record for a replica the topology never placed.
        let ghost = ReplicaId::Rn(RepNodeId::new(ShardId(9), 1));
        let mut params = Parameters::new();
        params.set_replica(
            ghost,
            crate::topology::NodeParams {
                storage_node: StorageNodeId(1),
                helper_hosts: vec![],
            },
        );

        let stages = build_repair_tasks(&topo, &params, &report_with(vec![]));
        assert_eq!(stages.len(), 1);
        assert!(matches!(
            stages[0].branches[0][0].kind,
            TaskKind::RemoveReplicaParams { id } if id == ghost
        ));
    }

    #[test]
    fn test_warnings_produce_no_tasks() {
        let topo = small_topo();
        let report = report_with(vec![Problem {
            kind: ProblemKind::UnderCapacity,
            resource: ResourceId::StorageNode(StorageNodeId(1)),
            severity: Severity::Warning,
            description: String::new(),
        }]);
        assert!(build_repair_tasks(&topo, &Parameters::new(), &report).is_empty());
    }
}
