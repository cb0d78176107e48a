//! Storage-node agent port.
//!
//! Every storage node runs an agent the orchestrator drives over RPC. The
//! transport is out of scope; the [`NodeAgent`] trait is the narrow,
//! transport-agnostic seam the plan engine and verification engine call
//! through. Implementations must report faults as
//! [`LatticeError::RemoteTransient`] (worth retrying) or
//! [`LatticeError::RemotePermanent`] (aborts the task).

use crate::error::{LatticeError, Result};
use crate::types::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Everything an agent needs to deploy one shard member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSpec {
    pub id: ReplicaId,
    pub helper_hosts: Vec<String>,
}

/// RPC surface of a storage-node agent.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// Create the replica's service on this host. Idempotent: deploying an
    /// already-deployed replica refreshes its spec and succeeds.
    async fn deploy(&self, spec: ReplicaSpec) -> Result<()>;

    /// Remove the replica's service and files. Idempotent.
    async fn remove(&self, id: ReplicaId) -> Result<()>;

    /// Stop the replica's service. `force` skips graceful handoff.
    async fn stop(&self, id: ReplicaId, force: bool) -> Result<()>;

    /// Start a deployed replica's service.
    async fn start(&self, id: ReplicaId) -> Result<()>;

    /// Current status of the replica's service on this host.
    async fn status(&self, id: ReplicaId) -> Result<ServiceStatus>;

    /// Replace the replica's stored parameters (helper hosts).
    async fn set_parameters(&self, id: ReplicaId, helper_hosts: Vec<String>) -> Result<()>;

    /// Tell a running replica to re-read its stored parameters.
    async fn new_parameters(&self, id: ReplicaId) -> Result<()>;

    /// Helper hosts currently stored for the replica, if deployed.
    async fn get_parameters(&self, id: ReplicaId) -> Result<Option<Vec<String>>>;

    /// Deploy an admin replica on this host.
    async fn deploy_admin(&self, id: AdminId, admin_type: ZoneType) -> Result<()>;

    /// Remove an admin replica from this host. Idempotent.
    async fn remove_admin(&self, id: AdminId) -> Result<()>;

    /// Update an admin replica's type.
    async fn set_admin_type(&self, id: AdminId, admin_type: ZoneType) -> Result<()>;

    /// Admin status on this host, `None` if never deployed.
    async fn admin_status(&self, id: AdminId) -> Result<Option<(ServiceStatus, ZoneType)>>;

    /// Cheap liveness probe of the agent itself.
    async fn ping(&self) -> Result<()>;
}

/// Registry mapping storage nodes to their agents. Shared by the plan
/// executor, the quorum checker and verification.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<StorageNodeId, Arc<dyn NodeAgent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sn: StorageNodeId, agent: Arc<dyn NodeAgent>) {
        self.agents.write().await.insert(sn, agent);
    }

    pub async fn deregister(&self, sn: StorageNodeId) {
        self.agents.write().await.remove(&sn);
    }

    pub async fn agent(&self, sn: StorageNodeId) -> Result<Arc<dyn NodeAgent>> {
        self.agents
            .read()
            .await
            .get(&sn)
            .cloned()
            .ok_or_else(|| LatticeError::NoAgent(sn.to_string()))
    }

    /// Probe a storage node's agent; false on any fault.
    pub async fn is_reachable(&self, sn: StorageNodeId) -> bool {
        match self.agent(sn).await {
            Ok(agent) => agent.ping().await.is_ok(),
            Err(_) => false,
        }
    }
}
