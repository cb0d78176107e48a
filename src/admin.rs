//! Administrative surface: candidates, plans, verification.
//!
//! `AdminService` is the single entry point operators drive. Topology and
//! parameter records live in the metadata store; candidates and pools are
//! working state of this admin. Plan approval and execution are gated on
//! mastership, and deploy-plan creation is serialized so two topologies
//! can never be diffed against the same base concurrently.

use crate::agent::AgentRegistry;
use crate::config::OrchestratorConfig;
use crate::error::{LatticeError, Result};
use crate::faults::{FaultInjector, NoopInjector};
use crate::plan::{
    build_deploy_tasks, build_repair_tasks, ExecContext, Plan, PlanExecutor, PlanState, PlanStore,
};
use crate::quorum::QuorumChecker;
use crate::store::{MemoryStore, MetadataStore, RocksStore, StoreHandle};
use crate::topology::{
    diff, CandidateStore, PlacementParams, StorageNodePool, Topology, TopologyBuilder,
    TopologyCandidate,
};
use crate::types::*;
use crate::verify::{Verifier, VerifyOptions, VerifyReport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

pub struct AdminService {
    config: OrchestratorConfig,
    ctx: ExecContext,
    plans: PlanStore,
    executor: PlanExecutor,
    candidates: CandidateStore,
    pools: RwLock<HashMap<String, StorageNodePool>>,
    verifier: Verifier,
    quorum: QuorumChecker,
    is_master: AtomicBool,
    deploy_lock: Mutex<()>,
}

impl AdminService {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn MetadataStore>,
        agents: AgentRegistry,
        faults: Arc<dyn FaultInjector>,
    ) -> Self {
        let ctx = ExecContext {
            store: Arc::clone(&store),
            agents: agents.clone(),
            config: config.execution.clone(),
            faults,
        };
        let plans = PlanStore::new(store);
        let executor = PlanExecutor::new(ctx.clone(), plans.clone());
        Self {
            config,
            ctx,
            plans,
            executor,
            candidates: CandidateStore::new(),
            pools: RwLock::new(HashMap::new()),
            verifier: Verifier::new(agents.clone()),
            quorum: QuorumChecker::new(agents),
            is_master: AtomicBool::new(true),
            deploy_lock: Mutex::new(()),
        }
    }

    /// Open with the store backend the configuration selects.
    pub fn open(config: OrchestratorConfig, agents: AgentRegistry) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn MetadataStore> = match &config.store_path {
            Some(path) => Arc::new(RocksStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(config, store, agents, Arc::new(NoopInjector)))
    }

    /// Mastership gate. A standby admin answers reads but refuses any plan
    /// mutation until promoted.
    pub fn set_master(&self, master: bool) {
        self.is_master.store(master, Ordering::SeqCst);
    }

    fn require_master(&self) -> Result<()> {
        if self.is_master.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LatticeError::NotMaster)
        }
    }

    fn handle(&self) -> StoreHandle<'_> {
        StoreHandle::new(self.ctx.store.as_ref())
    }

    // ---- topology bootstrap ------------------------------------------------

    /// Current deployed topology (empty at sequence 0 if nothing deployed).
    pub fn topology(&self) -> Result<Topology> {
        Ok(self
            .handle()
            .load_topology()?
            .map(|(topo, _)| topo)
            .unwrap_or_default())
    }

    pub fn add_zone(
        &self,
        name: impl Into<String>,
        rep_factor: u32,
        zone_type: ZoneType,
        allow_arbiters: bool,
    ) -> Result<ZoneId> {
        self.require_master()?;
        let (mut topo, version) = self.load_or_new_topology()?;
        let id = topo.add_zone(name, rep_factor, zone_type, allow_arbiters)?;
        self.handle().save_topology(&topo, version)?;
        Ok(id)
    }

    pub fn add_storage_node(
        &self,
        zone: ZoneId,
        host: impl Into<String>,
        capacity: u32,
    ) -> Result<StorageNodeId> {
        self.require_master()?;
        let (mut topo, version) = self.load_or_new_topology()?;
        let id = topo.add_storage_node(zone, host, capacity)?;
        self.handle().save_topology(&topo, version)?;
        Ok(id)
    }

    pub fn add_admin_replica(&self, sn: StorageNodeId) -> Result<AdminId> {
        self.require_master()?;
        let (mut topo, version) = self.load_or_new_topology()?;
        let id = topo.add_admin(sn)?;
        self.handle().save_topology(&topo, version)?;
        Ok(id)
    }

    fn load_or_new_topology(&self) -> Result<(Topology, Option<u64>)> {
        Ok(match self.handle().load_topology()? {
            Some((topo, version)) => (topo, Some(version)),
            None => (Topology::new(), None),
        })
    }

    fn deployed_topology(&self) -> Result<(Topology, u64)> {
        self.handle()
            .load_topology()?
            .ok_or_else(|| LatticeError::Inconsistency("no topology deployed".into()))
    }

    // ---- pools and candidates ----------------------------------------------

    pub async fn create_pool(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let mut pools = self.pools.write().await;
        if pools.contains_key(&name) {
            return Err(LatticeError::Validation(format!(
                "pool {} already exists",
                name
            )));
        }
        pools.insert(name.clone(), StorageNodePool::new(name));
        Ok(())
    }

    pub async fn add_pool_member(&self, pool: &str, sn: StorageNodeId) -> Result<()> {
        let topo = self.topology()?;
        if topo.storage_node(sn).is_none() {
            return Err(LatticeError::Validation(format!(
                "unknown storage node {}",
                sn
            )));
        }
        let mut pools = self.pools.write().await;
        let entry = pools
            .get_mut(pool)
            .ok_or_else(|| LatticeError::UnknownPool(pool.to_string()))?;
        entry.members.insert(sn);
        Ok(())
    }

    async fn pool(&self, name: &str) -> Result<StorageNodePool> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LatticeError::UnknownPool(name.to_string()))
    }

    /// Build the initial store layout as a named candidate.
    pub async fn create_candidate(
        &self,
        name: impl Into<String>,
        pool: &str,
        partitions: u32,
    ) -> Result<()> {
        let pool = self.pool(pool).await?;
        let deployed = self.topology()?;
        let built =
            TopologyBuilder::new(&deployed, &pool).build_initial(PlacementParams { partitions })?;
        self.candidates
            .add(TopologyCandidate::new(name, built))
            .await
    }

    pub async fn rebalance(&self, name: impl Into<String>, pool: &str) -> Result<()> {
        let pool = self.pool(pool).await?;
        let (deployed, _) = self.deployed_topology()?;
        let built = TopologyBuilder::new(&deployed, &pool).rebalance()?;
        self.candidates
            .add(TopologyCandidate::new(name, built))
            .await
    }

    pub async fn redistribute(&self, name: impl Into<String>, pool: &str) -> Result<()> {
        let pool = self.pool(pool).await?;
        let (deployed, _) = self.deployed_topology()?;
        let built = TopologyBuilder::new(&deployed, &pool).redistribute()?;
        self.candidates
            .add(TopologyCandidate::new(name, built))
            .await
    }

    pub async fn contract(&self, name: impl Into<String>, pool: &str) -> Result<()> {
        let pool = self.pool(pool).await?;
        let (deployed, _) = self.deployed_topology()?;
        let built = TopologyBuilder::new(&deployed, &pool).contract()?;
        self.candidates
            .add(TopologyCandidate::new(name, built))
            .await
    }

    pub async fn move_node(
        &self,
        name: impl Into<String>,
        pool: &str,
        id: RepNodeId,
        target: Option<StorageNodeId>,
    ) -> Result<()> {
        let pool = self.pool(pool).await?;
        let (deployed, _) = self.deployed_topology()?;
        let built = TopologyBuilder::new(&deployed, &pool).move_replica(id, target)?;
        self.candidates
            .add(TopologyCandidate::new(name, built))
            .await
    }

    pub async fn change_zone_type(
        &self,
        name: impl Into<String>,
        pool: &str,
        zone: ZoneId,
        new_type: ZoneType,
    ) -> Result<()> {
        let pool = self.pool(pool).await?;
        let (deployed, _) = self.deployed_topology()?;
        let built = TopologyBuilder::new(&deployed, &pool).change_zone_type(zone, new_type)?;
        self.candidates
            .add(TopologyCandidate::new(name, built))
            .await
    }

    pub async fn candidate(&self, name: &str) -> Result<TopologyCandidate> {
        self.candidates.get(name).await
    }

    pub async fn list_candidates(&self) -> Vec<String> {
        self.candidates.list().await
    }

    pub async fn drop_candidate(&self, name: &str) -> Result<()> {
        self.candidates.remove(name).await.map(|_| ())
    }

    // ---- plans ---------------------------------------------------------------

    /// Diff the candidate against the deployed topology and persist a
    /// PENDING plan. All static validation happens here, before any remote
    /// call is made.
    pub async fn create_deploy_topology_plan(
        &self,
        plan_name: impl Into<String>,
        candidate_name: &str,
    ) -> Result<u64> {
        self.require_master()?;
        let _serialize = self.deploy_lock.lock().await;

        let candidate = self.candidates.get(candidate_name).await?;
        let deployed = self.topology()?;
        let set = diff(&deployed, &candidate.topology)?;
        let stages = build_deploy_tasks(&set);

        let id = self.handle().next_plan_id()?;
        let plan = Plan::new(id, plan_name, stages);
        self.plans.save(&plan)?;
        info!(
            plan_id = id,
            candidate = candidate_name,
            changes = set.change_count(),
            "deploy-topology plan created"
        );
        Ok(id)
    }

    /// Verify the configuration and persist a PENDING plan fixing what it
    /// found. Built purely from live state, never from a failed plan.
    pub async fn create_repair_plan(&self, plan_name: impl Into<String>) -> Result<u64> {
        self.require_master()?;
        let (topo, _) = self.deployed_topology()?;
        let params = self.parameters()?;
        let report = self
            .verifier
            .verify(&topo, &params, VerifyOptions::default())
            .await?;
        let stages = build_repair_tasks(&topo, &params, &report);

        let id = self.handle().next_plan_id()?;
        let plan = Plan::new(id, plan_name, stages);
        self.plans.save(&plan)?;
        info!(
            plan_id = id,
            violations = report.violation_count(),
            tasks = plan.task_count(),
            "repair plan created"
        );
        Ok(id)
    }

    pub fn approve_plan(&self, plan_id: u64) -> Result<()> {
        self.require_master()?;
        let mut plan = self.plans.load(plan_id)?;
        plan.approve()?;
        self.plans.save(&plan)
    }

    /// Run an approved (or stopped, re-runnable) plan to completion and
    /// return its final state.
    pub async fn execute_plan(&self, plan_id: u64) -> Result<PlanState> {
        self.require_master()?;
        let state = self.executor.execute(plan_id).await?;
        if state.is_terminal() || state == PlanState::Error {
            if let Err(err) = self.plans.prune(self.config.retention.plan_retention) {
                warn!(%err, "plan pruning failed");
            }
        }
        Ok(state)
    }

    /// Wait until the plan stops executing. Plans that are still PENDING or
    /// APPROVED are waited on too, so callers can execute concurrently.
    pub async fn await_plan(&self, plan_id: u64, timeout: Duration) -> Result<PlanState> {
        let mut events = self.plans.subscribe();
        let state = self.plans.load(plan_id)?.state;
        if stopped(state) {
            return Ok(state);
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.plan_id == plan_id && stopped(event.state) => {
                        return Ok(event.state);
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // Lagged or closed; fall back to the stored record.
                        let state = self.plans.load(plan_id)?.state;
                        if stopped(state) {
                            return Ok(state);
                        }
                        events = self.plans.subscribe();
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(LatticeError::Internal(format!(
                "timed out waiting for plan {}",
                plan_id
            ))),
        }
    }

    /// Error with the root-cause class unless the plan SUCCEEDED.
    pub fn assert_success(&self, plan_id: u64) -> Result<()> {
        let plan = self.plans.load(plan_id)?;
        if plan.state == PlanState::Succeeded {
            return Ok(());
        }
        let cause = match &plan.failure {
            Some(failure) => format!("{}: {}", failure.class, failure.message),
            None => "no failure recorded".to_string(),
        };
        Err(LatticeError::PlanFailed {
            plan_id,
            state: plan.state.to_string(),
            cause,
        })
    }

    pub fn cancel_plan(&self, plan_id: u64) -> Result<()> {
        self.require_master()?;
        let mut plan = self.plans.load(plan_id)?;
        plan.cancel()?;
        self.plans.save(&plan)
    }

    /// Stop a RUNNING plan at its next task boundary.
    pub fn interrupt_plan(&self, plan_id: u64) -> Result<()> {
        self.require_master()?;
        let mut plan = self.plans.load(plan_id)?;
        if plan.state != PlanState::Running {
            return Err(LatticeError::IllegalPlanState {
                plan_id,
                state: plan.state.to_string(),
                action: "interrupt".to_string(),
            });
        }
        plan.interrupt_requested = true;
        self.plans.save(&plan)?;
        self.executor.request_interrupt(plan_id);
        Ok(())
    }

    pub fn plan(&self, plan_id: u64) -> Result<Plan> {
        self.plans.load(plan_id)
    }

    pub fn plan_state(&self, plan_id: u64) -> Result<PlanState> {
        Ok(self.plans.load(plan_id)?.state)
    }

    pub fn list_plans(&self) -> Result<Vec<Plan>> {
        self.plans.list()
    }

    // ---- verification and health ---------------------------------------------

    pub fn parameters(&self) -> Result<crate::topology::Parameters> {
        Ok(self
            .handle()
            .load_parameters()?
            .map(|(params, _)| params)
            .unwrap_or_default())
    }

    pub async fn verify_configuration(&self, options: VerifyOptions) -> Result<VerifyReport> {
        let (topo, _) = self.deployed_topology()?;
        let params = self.parameters()?;
        self.verifier.verify(&topo, &params, options).await
    }

    /// Liveness summary across all shards, phrased for operators.
    pub async fn check_store_health(&self) -> Result<()> {
        let (topo, _) = self.deployed_topology()?;
        self.quorum.check_all_shards_safe(&topo).await
    }
}

fn stopped(state: PlanState) -> bool {
    matches!(
        state,
        PlanState::Succeeded | PlanState::Error | PlanState::Interrupted | PlanState::Canceled
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AdminService {
        AdminService::new(
            OrchestratorConfig::development(),
            Arc::new(MemoryStore::new()),
            AgentRegistry::new(),
            Arc::new(NoopInjector),
        )
    }

    #[tokio::test]
    async fn test_non_master_rejects_plan_mutations() {
        let admin = service();
        admin.set_master(false);
        assert!(matches!(
            admin.add_zone("zn1", 3, ZoneType::Primary, false),
            Err(LatticeError::NotMaster)
        ));
        assert!(matches!(
            admin.approve_plan(1),
            Err(LatticeError::NotMaster)
        ));
        assert!(matches!(
            admin.create_repair_plan("repair").await,
            Err(LatticeError::NotMaster)
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_and_candidate_flow() {
        let admin = service();
        let zone = admin.add_zone("zn1", 1, ZoneType::Primary, false).unwrap();
        let sn = admin.add_storage_node(zone, "h1:5000", 1).unwrap();
        admin.create_pool("pool1").await.unwrap();
        admin.add_pool_member("pool1", sn).await.unwrap();

        admin.create_candidate("first", "pool1", 4).await.unwrap();
        assert_eq!(admin.list_candidates().await, vec!["first"]);
        let candidate = admin.candidate("first").await.unwrap();
        assert_eq!(candidate.topology.shard_count(), 1);

        // Unknown pool is a typed error.
        assert!(matches!(
            admin.create_candidate("second", "nope", 4).await,
            Err(LatticeError::UnknownPool(_))
        ));
    }

    #[tokio::test]
    async fn test_deploy_plan_lifecycle_states() {
        let admin = service();
        let zone = admin.add_zone("zn1", 1, ZoneType::Primary, false).unwrap();
        let sn = admin.add_storage_node(zone, "h1:5000", 1).unwrap();
        admin.create_pool("pool1").await.unwrap();
        admin.add_pool_member("pool1", sn).await.unwrap();
        admin.create_candidate("first", "pool1", 2).await.unwrap();

        let plan_id = admin
            .create_deploy_topology_plan("deploy first", "first")
            .await
            .unwrap();
        assert_eq!(admin.plan_state(plan_id).unwrap(), PlanState::Pending);

        // Cancel is legal while PENDING; the canceled plan is immutable.
        admin.cancel_plan(plan_id).unwrap();
        assert_eq!(admin.plan_state(plan_id).unwrap(), PlanState::Canceled);
        assert!(admin.approve_plan(plan_id).is_err());
        let err = admin.assert_success(plan_id).unwrap_err();
        assert!(matches!(err, LatticeError::PlanFailed { .. }));
    }
}
