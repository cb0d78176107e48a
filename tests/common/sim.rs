// Simulated storage-node agents and cluster assembly for integration tests.

use async_trait::async_trait;
use lattice::admin::AdminService;
use lattice::agent::{AgentRegistry, NodeAgent, ReplicaSpec};
use lattice::config::OrchestratorConfig;
use lattice::error::{LatticeError, Result};
use lattice::faults::{FaultInjector, NoopInjector};
use lattice::plan::PlanState;
use lattice::store::{MemoryStore, MetadataStore};
use lattice::types::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct SimReplica {
    status: ServiceStatus,
    helper_hosts: Vec<String>,
}

#[derive(Debug, Default)]
struct SimServices {
    replicas: HashMap<ReplicaId, SimReplica>,
    admins: HashMap<AdminId, (ServiceStatus, ZoneType)>,
}

/// In-memory agent for one storage node. Liveness is switchable so tests
/// can take nodes down mid-plan; every RPC attempt is counted fleet-wide.
pub struct SimAgent {
    host: String,
    alive: AtomicBool,
    calls: Arc<AtomicUsize>,
    services: Mutex<SimServices>,
}

impl SimAgent {
    fn new(host: String, calls: Arc<AtomicUsize>) -> Self {
        Self {
            host,
            alive: AtomicBool::new(true),
            calls,
            services: Mutex::new(SimServices::default()),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LatticeError::RemoteTransient {
                node: self.host.clone(),
                reason: "connection refused".to_string(),
            })
        }
    }

    fn missing(&self, id: impl std::fmt::Display) -> LatticeError {
        LatticeError::RemotePermanent {
            node: self.host.clone(),
            reason: format!("{} is not deployed here", id),
        }
    }

    // Direct inspection, not an RPC.
    pub fn replica_status(&self, id: ReplicaId) -> Option<ServiceStatus> {
        self.services
            .lock()
            .unwrap()
            .replicas
            .get(&id)
            .map(|r| r.status)
    }

    pub fn admin_state(&self, id: AdminId) -> Option<(ServiceStatus, ZoneType)> {
        self.services.lock().unwrap().admins.get(&id).copied()
    }

    /// Flip a deployed replica to Stopped behind the orchestrator's back.
    pub fn crash_replica(&self, id: ReplicaId) {
        if let Some(replica) = self.services.lock().unwrap().replicas.get_mut(&id) {
            replica.status = ServiceStatus::Stopped;
        }
    }

    /// Erase a service as if the node lost its disk.
    pub fn wipe_replica(&self, id: ReplicaId) {
        self.services.lock().unwrap().replicas.remove(&id);
    }
}

#[async_trait]
impl NodeAgent for SimAgent {
    async fn deploy(&self, spec: ReplicaSpec) -> Result<()> {
        self.check()?;
        let mut services = self.services.lock().unwrap();
        let entry = services.replicas.entry(spec.id).or_insert(SimReplica {
            status: ServiceStatus::Stopped,
            helper_hosts: Vec::new(),
        });
        entry.helper_hosts = spec.helper_hosts;
        Ok(())
    }

    async fn remove(&self, id: ReplicaId) -> Result<()> {
        self.check()?;
        self.services.lock().unwrap().replicas.remove(&id);
        Ok(())
    }

    async fn stop(&self, id: ReplicaId, _force: bool) -> Result<()> {
        self.check()?;
        let mut services = self.services.lock().unwrap();
        match services.replicas.get_mut(&id) {
            Some(replica) => {
                replica.status = ServiceStatus::Stopped;
                Ok(())
            }
            None => Err(self.missing(id)),
        }
    }

    async fn start(&self, id: ReplicaId) -> Result<()> {
        self.check()?;
        let mut services = self.services.lock().unwrap();
        match services.replicas.get_mut(&id) {
            Some(replica) => {
                replica.status = ServiceStatus::Running;
                Ok(())
            }
            None => Err(self.missing(id)),
        }
    }

    async fn status(&self, id: ReplicaId) -> Result<ServiceStatus> {
        self.check()?;
        Ok(self
            .services
            .lock()
            .unwrap()
            .replicas
            .get(&id)
            .map(|r| r.status)
            .unwrap_or(ServiceStatus::NotDeployed))
    }

    async fn set_parameters(&self, id: ReplicaId, helper_hosts: Vec<String>) -> Result<()> {
        self.check()?;
        let mut services = self.services.lock().unwrap();
        match services.replicas.get_mut(&id) {
            Some(replica) => {
                replica.helper_hosts = helper_hosts;
                Ok(())
            }
            None => Err(self.missing(id)),
        }
    }

    async fn new_parameters(&self, id: ReplicaId) -> Result<()> {
        self.check()?;
        if self.services.lock().unwrap().replicas.contains_key(&id) {
            Ok(())
        } else {
            Err(self.missing(id))
        }
    }

    async fn get_parameters(&self, id: ReplicaId) -> Result<Option<Vec<String>>> {
        self.check()?;
        Ok(self
            .services
            .lock()
            .unwrap()
            .replicas
            .get(&id)
            .map(|r| r.helper_hosts.clone()))
    }

    async fn deploy_admin(&self, id: AdminId, admin_type: ZoneType) -> Result<()> {
        self.check()?;
        self.services
            .lock()
            .unwrap()
            .admins
            .insert(id, (ServiceStatus::Running, admin_type));
        Ok(())
    }

    async fn remove_admin(&self, id: AdminId) -> Result<()> {
        self.check()?;
        self.services.lock().unwrap().admins.remove(&id);
        Ok(())
    }

    async fn set_admin_type(&self, id: AdminId, admin_type: ZoneType) -> Result<()> {
        self.check()?;
        let mut services = self.services.lock().unwrap();
        match services.admins.get_mut(&id) {
            Some(entry) => {
                entry.1 = admin_type;
                Ok(())
            }
            None => Err(self.missing(id)),
        }
    }

    async fn admin_status(&self, id: AdminId) -> Result<Option<(ServiceStatus, ZoneType)>> {
        self.check()?;
        Ok(self.services.lock().unwrap().admins.get(&id).copied())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

struct ZoneSpec {
    name: String,
    rep_factor: u32,
    zone_type: ZoneType,
    allow_arbiters: bool,
    nodes: u32,
    capacity: u32,
}

/// Builder for a simulated store: zones, nodes, agents, one admin service.
pub struct ClusterBuilder {
    zones: Vec<ZoneSpec>,
    faults: Arc<dyn FaultInjector>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            zones: Vec::new(),
            faults: Arc::new(NoopInjector),
        }
    }

    pub fn zone(self, rep_factor: u32, zone_type: ZoneType, nodes: u32, capacity: u32) -> Self {
        self.zone_with(rep_factor, zone_type, nodes, capacity, false)
    }

    pub fn zone_with(
        mut self,
        rep_factor: u32,
        zone_type: ZoneType,
        nodes: u32,
        capacity: u32,
        allow_arbiters: bool,
    ) -> Self {
        let name = format!("zone-{}", self.zones.len() + 1);
        self.zones.push(ZoneSpec {
            name,
            rep_factor,
            zone_type,
            allow_arbiters,
            nodes,
            capacity,
        });
        self
    }

    pub fn faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    pub async fn build(self) -> SimCluster {
        // RUST_LOG=lattice=debug surfaces executor traces in test output.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let calls = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let agents = AgentRegistry::new();
        let admin = AdminService::new(
            OrchestratorConfig::development(),
            Arc::clone(&store),
            agents.clone(),
            self.faults,
        );

        let mut sim_agents = HashMap::new();
        let mut storage_nodes = Vec::new();
        let mut zones = Vec::new();
        let mut host_num = 0u32;
        for spec in &self.zones {
            let zone = admin
                .add_zone(
                    spec.name.clone(),
                    spec.rep_factor,
                    spec.zone_type,
                    spec.allow_arbiters,
                )
                .unwrap();
            zones.push(zone);
            for _ in 0..spec.nodes {
                host_num += 1;
                let host = format!("host{}:5000", host_num);
                let sn = admin
                    .add_storage_node(zone, host.clone(), spec.capacity)
                    .unwrap();
                let agent = Arc::new(SimAgent::new(host, Arc::clone(&calls)));
                agents.register(sn, Arc::clone(&agent) as Arc<dyn NodeAgent>).await;
                sim_agents.insert(sn, agent);
                storage_nodes.push(sn);
            }
        }

        admin.create_pool("all").await.unwrap();
        for sn in &storage_nodes {
            admin.add_pool_member("all", *sn).await.unwrap();
        }

        SimCluster {
            admin: Arc::new(admin),
            agents,
            store,
            sim_agents,
            storage_nodes,
            zones,
            calls,
        }
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimCluster {
    pub admin: Arc<AdminService>,
    pub agents: AgentRegistry,
    pub store: Arc<dyn MetadataStore>,
    sim_agents: HashMap<StorageNodeId, Arc<SimAgent>>,
    pub storage_nodes: Vec<StorageNodeId>,
    pub zones: Vec<ZoneId>,
    calls: Arc<AtomicUsize>,
}

impl SimCluster {
    pub fn sim_agent(&self, sn: StorageNodeId) -> &Arc<SimAgent> {
        &self.sim_agents[&sn]
    }

    /// Register a fresh storage node with its agent and add it to the pool.
    pub async fn add_node(&mut self, zone: ZoneId, capacity: u32) -> StorageNodeId {
        let host = format!("host{}:5000", self.storage_nodes.len() + 1);
        let sn = self.admin.add_storage_node(zone, host.clone(), capacity).unwrap();
        let agent = Arc::new(SimAgent::new(host, Arc::clone(&self.calls)));
        self.agents
            .register(sn, Arc::clone(&agent) as Arc<dyn NodeAgent>)
            .await;
        self.sim_agents.insert(sn, agent);
        self.storage_nodes.push(sn);
        self.admin.add_pool_member("all", sn).await.unwrap();
        sn
    }

    pub fn kill_node(&self, sn: StorageNodeId) {
        self.sim_agents[&sn].set_alive(false);
    }

    pub fn revive_node(&self, sn: StorageNodeId) {
        self.sim_agents[&sn].set_alive(true);
    }

    /// Total agent RPC attempts across the fleet.
    pub fn remote_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Create, approve and execute a plan deploying the named candidate.
    pub async fn run_deploy_plan(&self, name: &str, candidate: &str) -> (u64, PlanState) {
        let plan_id = self
            .admin
            .create_deploy_topology_plan(name, candidate)
            .await
            .unwrap();
        self.admin.approve_plan(plan_id).unwrap();
        let state = self.admin.execute_plan(plan_id).await.unwrap();
        (plan_id, state)
    }

    /// Build and roll out the initial store layout across the whole pool.
    pub async fn deploy_initial(&self, partitions: u32) -> u64 {
        self.admin
            .create_candidate("initial", "all", partitions)
            .await
            .unwrap();
        let (plan_id, state) = self.run_deploy_plan("deploy initial", "initial").await;
        assert_eq!(state, PlanState::Succeeded, "initial deployment failed");
        plan_id
    }
}
