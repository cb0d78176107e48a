//! Plan execution: retries, idempotent replay, compensation, interrupts.
//!
//! The executor walks a plan's stages in order. Inside a stage every branch
//! runs concurrently; inside a branch, tasks run serially and each task's
//! completion marker is persisted before the next task starts. Re-executing
//! a plan therefore skips every marked task and re-runs the first unfinished
//! one from scratch.

use super::task::{Task, TaskKind};
use super::{Plan, PlanFailure, PlanState, PlanStore};
use crate::agent::{AgentRegistry, ReplicaSpec};
use crate::config::ExecutionConfig;
use crate::error::{LatticeError, Result};
use crate::faults::{self, FaultInjector};
use crate::quorum::QuorumChecker;
use crate::store::{MetadataStore, StoreHandle};
use crate::topology::{NodeParams, AdminParams, Parameters, Topology};
use crate::types::*;
use futures::stream::{self, StreamExt};
use rand::Rng;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Everything a task needs to act on the cluster.
#[derive(Clone)]
pub struct ExecContext {
    pub store: Arc<dyn MetadataStore>,
    pub agents: AgentRegistry,
    pub config: ExecutionConfig,
    pub faults: Arc<dyn FaultInjector>,
}

impl ExecContext {
    fn handle(&self) -> StoreHandle<'_> {
        StoreHandle::new(self.store.as_ref())
    }

    fn load_topology(&self) -> Result<(Topology, u64)> {
        self.handle()
            .load_topology()?
            .ok_or_else(|| LatticeError::Inconsistency("no topology deployed".into()))
    }
}

/// Outcome of one serial branch.
enum BranchOutcome {
    Completed,
    Interrupted,
    /// The injector simulated a process kill: stop dead, persist nothing.
    Killed,
    Failed(u32, LatticeError),
}

pub struct PlanExecutor {
    ctx: ExecContext,
    plans: PlanStore,
    quorum: QuorumChecker,
    /// Plan ids with a pending interrupt, honored at task boundaries.
    interrupts: Arc<std::sync::Mutex<BTreeSet<u64>>>,
}

impl PlanExecutor {
    pub fn new(ctx: ExecContext, plans: PlanStore) -> Self {
        let quorum = QuorumChecker::new(ctx.agents.clone());
        Self {
            ctx,
            plans,
            quorum,
            interrupts: Arc::new(std::sync::Mutex::new(BTreeSet::new())),
        }
    }

    /// Ask a running plan to stop at its next task boundary.
    pub fn request_interrupt(&self, plan_id: u64) {
        self.interrupts.lock().unwrap().insert(plan_id);
    }

    fn interrupt_requested(&self, plan_id: u64) -> bool {
        self.interrupts.lock().unwrap().contains(&plan_id)
    }

    /// Execute (or re-execute) a plan to completion. Returns the plan's
    /// final state; ERROR and INTERRUPTED are reported as states, not
    /// errors, so callers can inspect and re-run.
    pub async fn execute(&self, plan_id: u64) -> Result<PlanState> {
        let mut plan = self.plans.load(plan_id)?;
        if !plan.state.is_runnable() {
            return Err(LatticeError::IllegalPlanState {
                plan_id,
                state: plan.state.to_string(),
                action: "execute".to_string(),
            });
        }
        self.interrupts.lock().unwrap().remove(&plan_id);
        plan.failure = None;
        plan.ended_at = None;
        plan.interrupt_requested = false;
        plan.transition(PlanState::Running);
        self.plans.save(&plan)?;
        info!(plan_id, name = %plan.name, tasks = plan.task_count(), "plan started");

        let shared = Arc::new(Mutex::new(plan));
        let stages = shared.lock().await.stages.clone();

        for (stage_idx, stage) in stages.iter().enumerate() {
            let outcomes: Vec<BranchOutcome> = stream::iter(stage.branches.clone())
                .map(|branch| self.run_branch(plan_id, branch, Arc::clone(&shared)))
                .buffer_unordered(self.ctx.config.max_parallel_tasks.max(1))
                .collect()
                .await;

            let mut failure: Option<(u32, LatticeError)> = None;
            let mut interrupted = false;
            for outcome in outcomes {
                match outcome {
                    BranchOutcome::Completed => {}
                    BranchOutcome::Killed => {
                        // Simulated crash: the store still says RUNNING.
                        warn!(plan_id, stage = stage_idx, "execution killed");
                        return Ok(PlanState::Running);
                    }
                    BranchOutcome::Interrupted => interrupted = true,
                    BranchOutcome::Failed(task_id, err) => {
                        if failure.is_none() {
                            failure = Some((task_id, err));
                        }
                    }
                }
            }

            if let Some((task_id, err)) = failure {
                let mut plan = shared.lock().await;
                plan.failure = Some(PlanFailure {
                    task_id,
                    class: err.class().to_string(),
                    message: err.to_string(),
                });
                plan.transition(PlanState::Error);
                self.plans.save(&plan)?;
                error!(plan_id, task_id, %err, "plan failed");
                return Ok(PlanState::Error);
            }
            if interrupted {
                let mut plan = shared.lock().await;
                plan.interrupt_requested = false;
                plan.transition(PlanState::Interrupted);
                self.plans.save(&plan)?;
                info!(plan_id, stage = stage_idx, "plan interrupted");
                return Ok(PlanState::Interrupted);
            }
        }

        let mut plan = shared.lock().await;
        plan.transition(PlanState::Succeeded);
        self.plans.save(&plan)?;
        info!(plan_id, "plan succeeded");
        Ok(PlanState::Succeeded)
    }

    async fn run_branch(
        &self,
        plan_id: u64,
        branch: Vec<Task>,
        shared: Arc<Mutex<Plan>>,
    ) -> BranchOutcome {
        for task in branch {
            if self.interrupt_requested(plan_id) {
                return BranchOutcome::Interrupted;
            }
            if shared.lock().await.completed.contains(&task.id) {
                debug!(plan_id, task = %task, "replay: already complete");
                continue;
            }

            let label = task.kind.label();
            match faults::check(self.ctx.faults.as_ref(), &format!("before:{}", label)).await {
                Ok(false) => {}
                Ok(true) => return BranchOutcome::Killed,
                Err(err) => return self.fail_task(&task, err).await,
            }

            debug!(plan_id, task = %task, "task started");
            if let Err(err) = self.run_with_retry(&task).await {
                return self.fail_task(&task, err).await;
            }

            match faults::check(self.ctx.faults.as_ref(), &format!("after:{}", label)).await {
                Ok(false) => {}
                Ok(true) => return BranchOutcome::Killed,
                Err(err) => return self.fail_task(&task, err).await,
            }

            // Persist the marker before anything else runs.
            let mut plan = shared.lock().await;
            plan.completed.insert(task.id);
            if let Err(err) = self.plans.save(&plan) {
                return BranchOutcome::Failed(task.id, err);
            }
        }
        BranchOutcome::Completed
    }

    async fn fail_task(&self, task: &Task, err: LatticeError) -> BranchOutcome {
        warn!(task = %task, %err, "task failed, running compensation");
        if let Some(comp) = task.kind.compensation() {
            if let Err(comp_err) = self.run_task(&comp).await {
                warn!(task = %task, %comp_err, "compensation failed");
            }
        }
        BranchOutcome::Failed(task.id, err)
    }

    async fn run_with_retry(&self, task: &Task) -> Result<()> {
        let limit = self.ctx.config.task_retry_limit;
        let mut attempt = 0u32;
        loop {
            match self.run_task(&task.kind).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < limit => {
                    attempt += 1;
                    let backoff = self.backoff(attempt);
                    warn!(task = %task, attempt, %err, backoff_ms = backoff.as_millis() as u64, "retrying task");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.ctx.config.retry_backoff;
        let capped = base
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.ctx.config.max_backoff);
        let jitter_ms = if capped.as_millis() > 0 {
            rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4)
        } else {
            0
        };
        capped + Duration::from_millis(jitter_ms)
    }

    async fn rpc<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.ctx.config.rpc_timeout;
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LatticeError::RpcTimeout(timeout.as_millis() as u64)),
        }
    }

    /// One attempt at a leaf task. Every arm checks observable state first
    /// so a replay after a crash converges instead of failing.
    async fn run_task(&self, kind: &TaskKind) -> Result<()> {
        match kind {
            TaskKind::EnsureShardQuorum { shard, excluding } => {
                let (topo, _) = self.ctx.load_topology()?;
                self.quorum.check_shard_safe(&topo, *shard, *excluding).await
            }
            TaskKind::EnsureZoneQuorum { zone } => {
                let (topo, _) = self.ctx.load_topology()?;
                self.quorum.check_zone_safe(&topo, *zone).await
            }
            TaskKind::EnsureAdminQuorum { excluding } => {
                let (topo, _) = self.ctx.load_topology()?;
                self.quorum.check_admin_safe(&topo, *excluding).await
            }
            TaskKind::StopReplica { id, sn, force } => {
                let agent = self.ctx.agents.agent(*sn).await?;
                match self.rpc(agent.status(*id)).await? {
                    ServiceStatus::Stopped | ServiceStatus::NotDeployed => Ok(()),
                    _ => self.rpc(agent.stop(*id, *force)).await,
                }
            }
            TaskKind::StartReplica { id, sn } => {
                let agent = self.ctx.agents.agent(*sn).await?;
                match self.rpc(agent.status(*id)).await? {
                    ServiceStatus::Running => Ok(()),
                    ServiceStatus::NotDeployed => Err(LatticeError::Inconsistency(format!(
                        "{} is not deployed on {}",
                        id, sn
                    ))),
                    _ => self.rpc(agent.start(*id)).await,
                }
            }
            TaskKind::DeployReplica { id, sn } => {
                let (topo, _) = self.ctx.load_topology()?;
                let helper_hosts = topo.derive_helper_hosts(*id);
                let agent = self.ctx.agents.agent(*sn).await?;
                self.rpc(agent.deploy(ReplicaSpec {
                    id: *id,
                    helper_hosts,
                }))
                .await
            }
            TaskKind::RemoveReplicaService { id, sn } => {
                let agent = self.ctx.agents.agent(*sn).await?;
                self.rpc(agent.remove(*id)).await
            }
            TaskKind::WriteTopoChange { change } => {
                let (mut topo, version) = self.ctx.load_topology()?;
                if topo.apply_change(change)? {
                    self.ctx.handle().save_topology(&topo, Some(version))?;
                }
                Ok(())
            }
            TaskKind::WriteReplicaParams { id, sn } => {
                let (topo, _) = self.ctx.load_topology()?;
                let helper_hosts = topo.derive_helper_hosts(*id);
                let (mut params, version) = self.load_params()?;
                params.set_replica(
                    *id,
                    NodeParams {
                        storage_node: *sn,
                        helper_hosts,
                    },
                );
                self.ctx.handle().save_parameters(&params, version)?;
                Ok(())
            }
            TaskKind::RemoveReplicaParams { id } => {
                let (mut params, version) = self.load_params()?;
                if params.remove_replica(*id) {
                    self.ctx.handle().save_parameters(&params, version)?;
                }
                Ok(())
            }
            TaskKind::RefreshHelperHosts { shard } => self.refresh_helpers(*shard).await,
            TaskKind::DeployAdminService { id, sn } => {
                let (topo, _) = self.ctx.load_topology()?;
                let admin_type = topo
                    .admin(*id)
                    .map(|a| a.admin_type)
                    .ok_or_else(|| LatticeError::Inconsistency(format!("unknown admin {}", id)))?;
                let agent = self.ctx.agents.agent(*sn).await?;
                self.rpc(agent.deploy_admin(*id, admin_type)).await
            }
            TaskKind::RemoveAdminService { id, sn } => {
                let agent = self.ctx.agents.agent(*sn).await?;
                self.rpc(agent.remove_admin(*id)).await
            }
            TaskKind::SetAdminType { id, admin_type } => {
                let (topo, _) = self.ctx.load_topology()?;
                let sn = topo
                    .admin(*id)
                    .map(|a| a.storage_node)
                    .ok_or_else(|| LatticeError::Inconsistency(format!("unknown admin {}", id)))?;
                let agent = self.ctx.agents.agent(sn).await?;
                self.rpc(agent.set_admin_type(*id, *admin_type)).await
            }
            TaskKind::WriteAdminParams { id } => {
                let (topo, _) = self.ctx.load_topology()?;
                let admin = topo
                    .admin(*id)
                    .ok_or_else(|| LatticeError::Inconsistency(format!("unknown admin {}", id)))?;
                let (mut params, version) = self.load_params()?;
                params.set_admin(
                    *id,
                    AdminParams {
                        storage_node: admin.storage_node,
                        admin_type: admin.admin_type,
                    },
                );
                self.ctx.handle().save_parameters(&params, version)?;
                Ok(())
            }
            TaskKind::RemoveAdminParams { id } => {
                let (mut params, version) = self.load_params()?;
                if params.remove_admin(*id) {
                    self.ctx.handle().save_parameters(&params, version)?;
                }
                Ok(())
            }
        }
    }

    fn load_params(&self) -> Result<(Parameters, Option<u64>)> {
        Ok(match self.ctx.handle().load_parameters()? {
            Some((params, version)) => (params, Some(version)),
            None => (Parameters::new(), None),
        })
    }

    /// Push re-derived helper hosts to every member of the shard whose
    /// stored list went stale, and bring the parameter records along.
    async fn refresh_helpers(&self, shard: ShardId) -> Result<()> {
        let (topo, _) = self.ctx.load_topology()?;
        let (mut params, version) = self.load_params()?;
        let mut dirty = false;

        for member in topo.shard_members(shard) {
            let sn = match topo.replica_host(member) {
                Some(sn) => sn,
                None => continue,
            };
            let expected = topo.derive_helper_hosts(member);
            let agent = self.ctx.agents.agent(sn).await?;
            let stored = self.rpc(agent.get_parameters(member)).await?;
            if stored.as_deref() != Some(expected.as_slice()) {
                self.rpc(agent.set_parameters(member, expected.clone())).await?;
                self.rpc(agent.new_parameters(member)).await?;
            }
            let record = NodeParams {
                storage_node: sn,
                helper_hosts: expected,
            };
            if params.replica(member) != Some(&record) {
                params.set_replica(member, record);
                dirty = true;
            }
        }
        if dirty {
            self.ctx.handle().save_parameters(&params, version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::faults::NoopInjector;
    use crate::plan::{build_deploy_tasks, Plan};
    use crate::store::MemoryStore;
    use crate::topology::{diff, PlacementParams, StorageNodePool, TopologyBuilder};

    fn context() -> ExecContext {
        ExecContext {
            store: Arc::new(MemoryStore::new()),
            agents: AgentRegistry::new(),
            config: OrchestratorConfig::development().execution,
            faults: Arc::new(NoopInjector),
        }
    }

    /// Plans whose tasks are all store-local (no agents involved).
    fn topo_only_plan(ctx: &ExecContext) -> Plan {
        let mut topo = Topology::new();
        let zone = topo.add_zone("zn1", 1, ZoneType::Primary, false).unwrap();
        let mut pool = StorageNodePool::new("pool1");
        let sn = topo.add_storage_node(zone, "h1:1", 1).unwrap();
        pool.members.insert(sn);
        StoreHandle::new(ctx.store.as_ref())
            .save_topology(&topo, None)
            .unwrap();

        let candidate = TopologyBuilder::new(&topo, &pool)
            .build_initial(PlacementParams { partitions: 2 })
            .unwrap();
        let set = diff(&topo, &candidate).unwrap();
        // Keep only the store-local changes (shard + partitions).
        let stages = build_deploy_tasks(&set)
            .into_iter()
            .map(|mut stage| {
                stage.branches.iter_mut().for_each(|branch| {
                    branch.retain(|t| matches!(t.kind, TaskKind::WriteTopoChange { .. }))
                });
                stage
            })
            .filter(|s| s.task_count() > 0)
            .collect();
        Plan::new(1, "topo only", stages)
    }

    #[tokio::test]
    async fn test_execute_marks_tasks_and_succeeds() {
        let ctx = context();
        let plans = PlanStore::new(Arc::clone(&ctx.store));
        let mut plan = topo_only_plan(&ctx);
        let expected_tasks = plan.task_count();
        plan.approve().unwrap();
        plans.save(&plan).unwrap();

        let executor = PlanExecutor::new(ctx.clone(), plans.clone());
        let state = executor.execute(1).await.unwrap();
        assert_eq!(state, PlanState::Succeeded);

        let stored = plans.load(1).unwrap();
        assert_eq!(stored.completed.len(), expected_tasks);
        let (topo, _) = ctx.load_topology().unwrap();
        assert_eq!(topo.shard_count(), 1);
        assert_eq!(topo.partitions().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_rejects_pending_and_succeeded() {
        let ctx = context();
        let plans = PlanStore::new(Arc::clone(&ctx.store));
        let plan = topo_only_plan(&ctx);
        plans.save(&plan).unwrap();

        let executor = PlanExecutor::new(ctx, plans.clone());
        let err = executor.execute(1).await.unwrap_err();
        assert!(matches!(err, LatticeError::IllegalPlanState { .. }));

        let mut plan = plans.load(1).unwrap();
        plan.approve().unwrap();
        plans.save(&plan).unwrap();
        assert_eq!(executor.execute(1).await.unwrap(), PlanState::Succeeded);
        let err = executor.execute(1).await.unwrap_err();
        assert!(matches!(err, LatticeError::IllegalPlanState { .. }));
    }

    #[tokio::test]
    async fn test_replay_skips_completed_tasks() {
        let ctx = context();
        let plans = PlanStore::new(Arc::clone(&ctx.store));
        let mut plan = topo_only_plan(&ctx);
        plan.approve().unwrap();
        plans.save(&plan).unwrap();

        let executor = PlanExecutor::new(ctx.clone(), plans.clone());
        executor.execute(1).await.unwrap();
        let (_, seq_after_first) = ctx.load_topology().unwrap();

        // Force the plan back to a runnable state and replay everything.
        let mut plan = plans.load(1).unwrap();
        plan.transition(PlanState::Interrupted);
        plans.save(&plan).unwrap();
        assert_eq!(executor.execute(1).await.unwrap(), PlanState::Succeeded);

        // Nothing re-applied: the topology version is unchanged.
        let (_, seq_after_replay) = ctx.load_topology().unwrap();
        assert_eq!(seq_after_first, seq_after_replay);
    }
}
