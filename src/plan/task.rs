//! Leaf tasks and the expansion of an ordered change set into a task tree.
//!
//! Each topology change expands into a short serial branch of leaf tasks.
//! Branches from the same change group run in parallel (the diff guarantees
//! they affect distinct shards); groups run strictly in order.

use crate::topology::{OrderedChangeSet, TopoChange};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One idempotent unit of work. Every variant can be re-run after a crash:
/// it inspects current state first and does nothing if its effect already
/// holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Re-check, at execution time, that the shard keeps a simple majority
    /// of electable members if `excluding` goes down.
    EnsureShardQuorum {
        shard: ShardId,
        excluding: Option<ReplicaId>,
    },
    /// Re-check that a majority of the zone's storage nodes are reachable.
    EnsureZoneQuorum { zone: ZoneId },
    /// Re-check that a majority of primary admins stays available.
    EnsureAdminQuorum { excluding: Option<AdminId> },
    StopReplica {
        id: ReplicaId,
        sn: StorageNodeId,
        force: bool,
    },
    StartReplica { id: ReplicaId, sn: StorageNodeId },
    /// Deploy the replica's service with helper hosts derived from the
    /// persisted topology.
    DeployReplica { id: ReplicaId, sn: StorageNodeId },
    RemoveReplicaService { id: ReplicaId, sn: StorageNodeId },
    /// Read-modify-write one change into the persisted topology at its
    /// current version.
    WriteTopoChange { change: TopoChange },
    /// Upsert the replica's parameter record (host, helper hosts).
    WriteReplicaParams { id: ReplicaId, sn: StorageNodeId },
    RemoveReplicaParams { id: ReplicaId },
    /// Push re-derived helper hosts to every member of the shard whose
    /// stored list is stale.
    RefreshHelperHosts { shard: ShardId },
    DeployAdminService { id: AdminId, sn: StorageNodeId },
    RemoveAdminService { id: AdminId, sn: StorageNodeId },
    /// Push the admin type recorded in the persisted topology to the
    /// admin's agent.
    SetAdminType { id: AdminId, admin_type: ZoneType },
    /// Upsert the admin's parameter record from the persisted topology.
    WriteAdminParams { id: AdminId },
    RemoveAdminParams { id: AdminId },
}

impl TaskKind {
    /// Best-effort undo run when this task fails mid-way. Store writes are
    /// atomic and need none; agent-facing steps undo their service effect.
    pub fn compensation(&self) -> Option<TaskKind> {
        match self {
            TaskKind::StopReplica { id, sn, .. } => Some(TaskKind::StartReplica {
                id: *id,
                sn: *sn,
            }),
            TaskKind::DeployReplica { id, sn } => Some(TaskKind::RemoveReplicaService {
                id: *id,
                sn: *sn,
            }),
            TaskKind::DeployAdminService { id, sn } => Some(TaskKind::RemoveAdminService {
                id: *id,
                sn: *sn,
            }),
            _ => None,
        }
    }

    /// Stable label used in logs and fault-injection points.
    pub fn label(&self) -> String {
        match self {
            TaskKind::EnsureShardQuorum { shard, .. } => format!("ensure-quorum {}", shard),
            TaskKind::EnsureZoneQuorum { zone } => format!("ensure-zone-quorum {}", zone),
            TaskKind::EnsureAdminQuorum { .. } => "ensure-admin-quorum".to_string(),
            TaskKind::StopReplica { id, .. } => format!("stop {}", id),
            TaskKind::StartReplica { id, .. } => format!("start {}", id),
            TaskKind::DeployReplica { id, .. } => format!("deploy {}", id),
            TaskKind::RemoveReplicaService { id, .. } => format!("remove {}", id),
            TaskKind::WriteTopoChange { change } => format!("write-topo {}", change_label(change)),
            TaskKind::WriteReplicaParams { id, .. } => format!("write-params {}", id),
            TaskKind::RemoveReplicaParams { id } => format!("remove-params {}", id),
            TaskKind::RefreshHelperHosts { shard } => format!("refresh-helpers {}", shard),
            TaskKind::DeployAdminService { id, .. } => format!("deploy-admin {}", id),
            TaskKind::RemoveAdminService { id, .. } => format!("remove-admin {}", id),
            TaskKind::SetAdminType { id, .. } => format!("set-admin-type {}", id),
            TaskKind::WriteAdminParams { id } => format!("write-admin-params {}", id),
            TaskKind::RemoveAdminParams { id } => format!("remove-admin-params {}", id),
        }
    }
}

fn change_label(change: &TopoChange) -> String {
    match change {
        TopoChange::PromoteZone { zone } => format!("promote {}", zone),
        TopoChange::DemoteZone { zone } => format!("demote {}", zone),
        TopoChange::ChangeAdminType { admin, .. } => format!("admin-type {}", admin),
        TopoChange::CreateShard { shard } => format!("create {}", shard),
        TopoChange::RemoveShard { shard } => format!("remove {}", shard),
        TopoChange::DeployRepNode { id, .. } => format!("deploy {}", id),
        TopoChange::DeployArbNode { id, .. } => format!("deploy {}", id),
        TopoChange::RelocateRepNode { id, .. } => format!("relocate {}", id),
        TopoChange::RelocateArbNode { id, .. } => format!("relocate {}", id),
        TopoChange::RemoveRepNode { id, .. } => format!("remove {}", id),
        TopoChange::RemoveArbNode { id, .. } => format!("remove {}", id),
        TopoChange::DeployAdmin { id, .. } => format!("deploy {}", id),
        TopoChange::RemoveAdmin { id, .. } => format!("remove {}", id),
        TopoChange::CreatePartition { partition, .. } => format!("create {}", partition),
        TopoChange::AssignPartition { partition, .. } => format!("assign {}", partition),
    }
}

/// A numbered leaf task. Ids are unique within their plan and key the
/// persisted completion markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: u32,
    pub kind: TaskKind,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} [{}]", self.id, self.kind.label())
    }
}

/// One stage of a plan: serial branches executed concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStage {
    pub branches: Vec<Vec<Task>>,
}

impl TaskStage {
    pub fn task_count(&self) -> usize {
        self.branches.iter().map(|b| b.len()).sum()
    }
}

struct TaskIds(u32);

impl TaskIds {
    fn next(&mut self, kind: TaskKind) -> Task {
        self.0 += 1;
        Task { id: self.0, kind }
    }
}

/// Expand an ordered change set into the task tree of a deploy-topology
/// plan.
pub fn build_deploy_tasks(set: &OrderedChangeSet) -> Vec<TaskStage> {
    let mut ids = TaskIds(0);
    let mut stages = Vec::new();
    for group in &set.groups {
        let branches: Vec<Vec<Task>> = group
            .changes
            .iter()
            .map(|change| expand_change(change, &mut ids))
            .collect();
        if !branches.is_empty() {
            stages.push(TaskStage { branches });
        }

        // A deploy group may contain several members of one shard, so the
        // helper-host refresh waits until the whole group has landed.
        let deployed_shards: std::collections::BTreeSet<ShardId> = group
            .changes
            .iter()
            .filter_map(|c| match c {
                TopoChange::DeployRepNode { id, .. } => Some(id.shard),
                TopoChange::DeployArbNode { id, .. } => Some(id.shard),
                _ => None,
            })
            .collect();
        if !deployed_shards.is_empty() {
            let branches = deployed_shards
                .into_iter()
                .map(|shard| vec![ids.next(TaskKind::RefreshHelperHosts { shard })])
                .collect();
            stages.push(TaskStage { branches });
        }
    }
    stages
}

fn expand_change(change: &TopoChange, ids: &mut TaskIds) -> Vec<Task> {
    let write = TaskKind::WriteTopoChange {
        change: change.clone(),
    };
    match change {
        TopoChange::PromoteZone { zone } | TopoChange::DemoteZone { zone } => vec![
            ids.next(TaskKind::EnsureZoneQuorum { zone: *zone }),
            ids.next(write),
        ],
        TopoChange::ChangeAdminType { admin, new_type } => vec![
            ids.next(write),
            ids.next(TaskKind::WriteAdminParams { id: *admin }),
            ids.next(TaskKind::SetAdminType {
                id: *admin,
                admin_type: *new_type,
            }),
        ],
        TopoChange::CreateShard { .. }
        | TopoChange::RemoveShard { .. }
        | TopoChange::CreatePartition { .. }
        | TopoChange::AssignPartition { .. } => vec![ids.next(write)],
        TopoChange::DeployRepNode { id, sn } => {
            deploy_branch(ReplicaId::Rn(*id), *sn, write, ids)
        }
        TopoChange::DeployArbNode { id, sn } => {
            deploy_branch(ReplicaId::An(*id), *sn, write, ids)
        }
        TopoChange::RelocateRepNode { id, from, to } => {
            relocate_branch(ReplicaId::Rn(*id), *from, *to, write, ids)
        }
        TopoChange::RelocateArbNode { id, from, to } => {
            relocate_branch(ReplicaId::An(*id), *from, *to, write, ids)
        }
        TopoChange::RemoveRepNode { id, sn } => {
            remove_branch(ReplicaId::Rn(*id), *sn, write, ids)
        }
        TopoChange::RemoveArbNode { id, sn } => {
            remove_branch(ReplicaId::An(*id), *sn, write, ids)
        }
        TopoChange::DeployAdmin { id, sn } => vec![
            ids.next(write),
            ids.next(TaskKind::WriteAdminParams { id: *id }),
            ids.next(TaskKind::DeployAdminService { id: *id, sn: *sn }),
        ],
        TopoChange::RemoveAdmin { id, sn } => vec![
            ids.next(TaskKind::EnsureAdminQuorum {
                excluding: Some(*id),
            }),
            ids.next(TaskKind::RemoveAdminService { id: *id, sn: *sn }),
            ids.next(TaskKind::RemoveAdminParams { id: *id }),
            ids.next(write),
        ],
    }
}

fn deploy_branch(
    id: ReplicaId,
    sn: StorageNodeId,
    write: TaskKind,
    ids: &mut TaskIds,
) -> Vec<Task> {
    vec![
        ids.next(write),
        ids.next(TaskKind::WriteReplicaParams { id, sn }),
        ids.next(TaskKind::DeployReplica { id, sn }),
        ids.next(TaskKind::StartReplica { id, sn }),
    ]
}

fn relocate_branch(
    id: ReplicaId,
    from: StorageNodeId,
    to: StorageNodeId,
    write: TaskKind,
    ids: &mut TaskIds,
) -> Vec<Task> {
    vec![
        ids.next(TaskKind::EnsureShardQuorum {
            shard: id.shard(),
            excluding: Some(id),
        }),
        ids.next(TaskKind::StopReplica {
            id,
            sn: from,
            force: false,
        }),
        ids.next(write),
        ids.next(TaskKind::WriteReplicaParams { id, sn: to }),
        ids.next(TaskKind::DeployReplica { id, sn: to }),
        ids.next(TaskKind::StartReplica { id, sn: to }),
        ids.next(TaskKind::RefreshHelperHosts { shard: id.shard() }),
        ids.next(TaskKind::RemoveReplicaService { id, sn: from }),
    ]
}

fn remove_branch(
    id: ReplicaId,
    sn: StorageNodeId,
    write: TaskKind,
    ids: &mut TaskIds,
) -> Vec<Task> {
    vec![
        ids.next(TaskKind::EnsureShardQuorum {
            shard: id.shard(),
            excluding: Some(id),
        }),
        ids.next(TaskKind::StopReplica {
            id,
            sn,
            force: true,
        }),
        ids.next(TaskKind::RemoveReplicaService { id, sn }),
        ids.next(TaskKind::RemoveReplicaParams { id }),
        ids.next(write),
        ids.next(TaskKind::RefreshHelperHosts { shard: id.shard() }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ChangeGroup;

    fn single_change_set(change: TopoChange) -> OrderedChangeSet {
        OrderedChangeSet {
            base_sequence: 0,
            groups: vec![ChangeGroup {
                changes: vec![change],
            }],
        }
    }

    #[test]
    fn test_relocation_expands_quorum_first_remove_last() {
        let id = RepNodeId::new(ShardId(1), 2);
        let set = single_change_set(TopoChange::RelocateRepNode {
            id,
            from: StorageNodeId(1),
            to: StorageNodeId(2),
        });
        let stages = build_deploy_tasks(&set);
        assert_eq!(stages.len(), 1);
        let branch = &stages[0].branches[0];
        assert!(matches!(
            branch.first().unwrap().kind,
            TaskKind::EnsureShardQuorum {
                excluding: Some(ReplicaId::Rn(rn)),
                ..
            } if rn == id
        ));
        assert!(matches!(
            branch.last().unwrap().kind,
            TaskKind::RemoveReplicaService { sn: StorageNodeId(1), .. }
        ));
        // The old service goes away only after the replacement is started.
        let start_pos = branch
            .iter()
            .position(|t| matches!(t.kind, TaskKind::StartReplica { .. }))
            .unwrap();
        let remove_pos = branch
            .iter()
            .position(|t| matches!(t.kind, TaskKind::RemoveReplicaService { .. }))
            .unwrap();
        assert!(start_pos < remove_pos);
    }

    #[test]
    fn test_task_ids_unique_across_stages() {
        let set = OrderedChangeSet {
            base_sequence: 0,
            groups: vec![
                ChangeGroup {
                    changes: vec![TopoChange::CreateShard { shard: ShardId(1) }],
                },
                ChangeGroup {
                    changes: vec![
                        TopoChange::DeployRepNode {
                            id: RepNodeId::new(ShardId(1), 1),
                            sn: StorageNodeId(1),
                        },
                        TopoChange::DeployRepNode {
                            id: RepNodeId::new(ShardId(2), 1),
                            sn: StorageNodeId(2),
                        },
                    ],
                },
            ],
        };
        let stages = build_deploy_tasks(&set);
        let mut seen = std::collections::BTreeSet::new();
        for stage in &stages {
            for branch in &stage.branches {
                for task in branch {
                    assert!(seen.insert(task.id), "duplicate task id {}", task.id);
                }
            }
        }
        assert_eq!(seen.len(), 11);
    }

    #[test]
    fn test_compensation_pairs() {
        let stop = TaskKind::StopReplica {
            id: ReplicaId::Rn(RepNodeId::new(ShardId(1), 1)),
            sn: StorageNodeId(1),
            force: false,
        };
        assert!(matches!(
            stop.compensation(),
            Some(TaskKind::StartReplica { .. })
        ));
        let write = TaskKind::WriteTopoChange {
            change: TopoChange::CreateShard { shard: ShardId(1) },
        };
        assert!(write.compensation().is_none());
    }
}
