//! Common test utilities for integration tests.

pub mod sim;

pub use sim::*;

use lattice::plan::PlanState;
use lattice::types::ServiceStatus;
use std::time::Duration;

/// Generous ceiling for awaiting plan completion in tests.
pub const PLAN_WAIT: Duration = Duration::from_secs(30);

/// Assert a plan reached SUCCEEDED, with the failure record in the message
/// when it did not.
pub fn assert_succeeded(cluster: &SimCluster, plan_id: u64) {
    let plan = cluster.admin.plan(plan_id).unwrap();
    assert_eq!(
        plan.state,
        PlanState::Succeeded,
        "plan {} ended {:?}: {:?}",
        plan_id,
        plan.state,
        plan.failure
    );
}

/// Assert every replica the topology places reports Running on its agent.
pub async fn assert_all_running(cluster: &SimCluster) {
    let topo = cluster.admin.topology().unwrap();
    for shard in topo.shards() {
        for member in topo.shard_members(shard) {
            let sn = topo.replica_host(member).unwrap();
            let status = cluster.sim_agent(sn).replica_status(member);
            assert_eq!(
                status,
                Some(ServiceStatus::Running),
                "{} on {} is {:?}",
                member,
                sn,
                status
            );
        }
    }
}
