//! Plans: persisted, restartable units of cluster change.
//!
//! A plan is an ordered list of stages; each stage holds one or more serial
//! branches that run concurrently (branches never touch the same shard).
//! Every leaf task records a completion marker in the persisted plan record
//! before the next task starts, so a plan interrupted at any point can be
//! re-executed and will skip straight to the first unfinished task.

mod executor;
mod repair;
mod task;

pub use executor::{ExecContext, PlanExecutor};
pub use repair::build_repair_tasks;
pub use task::{build_deploy_tasks, Task, TaskKind, TaskStage};

use crate::error::{LatticeError, Result};
use crate::store::{self, MetadataStore, PLAN_PREFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Plan lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Pending,
    Approved,
    Running,
    Succeeded,
    Error,
    Interrupted,
    Canceled,
}

impl PlanState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanState::Succeeded | PlanState::Canceled
        )
    }

    /// States from which execution may (re)start.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            PlanState::Approved | PlanState::Running | PlanState::Error | PlanState::Interrupted
        )
    }

    /// Cancelation is only legal for plans that are stopped, never for a
    /// plan actively running.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            PlanState::Pending | PlanState::Approved | PlanState::Error | PlanState::Interrupted
        )
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanState::Pending => "PENDING",
            PlanState::Approved => "APPROVED",
            PlanState::Running => "RUNNING",
            PlanState::Succeeded => "SUCCEEDED",
            PlanState::Error => "ERROR",
            PlanState::Interrupted => "INTERRUPTED",
            PlanState::Canceled => "CANCELED",
        };
        f.write_str(name)
    }
}

/// Why a plan ended in ERROR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFailure {
    /// Failed leaf task id.
    pub task_id: u32,
    /// Root-cause class from [`LatticeError::class`].
    pub class: String,
    pub message: String,
}

/// Persisted plan record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: u64,
    pub name: String,
    pub state: PlanState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stages: Vec<TaskStage>,
    /// Leaf tasks whose effects are fully applied and persisted.
    pub completed: BTreeSet<u32>,
    /// Set by `interrupt_plan`; honored at the next task boundary.
    pub interrupt_requested: bool,
    pub failure: Option<PlanFailure>,
}

impl Plan {
    pub fn new(id: u64, name: impl Into<String>, stages: Vec<TaskStage>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            state: PlanState::Pending,
            created_at: now,
            updated_at: now,
            ended_at: None,
            stages,
            completed: BTreeSet::new(),
            interrupt_requested: false,
            failure: None,
        }
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.task_count()).sum()
    }

    pub fn approve(&mut self) -> Result<()> {
        if self.state != PlanState::Pending {
            return Err(self.illegal("approve"));
        }
        self.transition(PlanState::Approved);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        if !self.state.is_cancelable() {
            return Err(self.illegal("cancel"));
        }
        self.transition(PlanState::Canceled);
        Ok(())
    }

    pub(crate) fn transition(&mut self, state: PlanState) {
        self.state = state;
        self.updated_at = Utc::now();
        if state.is_terminal() || matches!(state, PlanState::Error | PlanState::Interrupted) {
            self.ended_at = Some(self.updated_at);
        }
    }

    fn illegal(&self, action: &str) -> LatticeError {
        LatticeError::IllegalPlanState {
            plan_id: self.id,
            state: self.state.to_string(),
            action: action.to_string(),
        }
    }
}

/// State-change notification published whenever a plan is persisted with a
/// new state. `await_plan` subscribes instead of polling.
#[derive(Debug, Clone)]
pub struct PlanEvent {
    pub plan_id: u64,
    pub state: PlanState,
}

/// Persistence and notification for plan records.
#[derive(Clone)]
pub struct PlanStore {
    store: Arc<dyn MetadataStore>,
    events: broadcast::Sender<PlanEvent>,
}

impl PlanStore {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.events.subscribe()
    }

    fn key(id: u64) -> String {
        // Zero-padded so lexicographic key order matches id order.
        format!("{}{:020}", PLAN_PREFIX, id)
    }

    /// Persist the plan record and publish its current state.
    pub fn save(&self, plan: &Plan) -> Result<()> {
        self.store.put(&Self::key(plan.id), &store::encode(plan)?)?;
        let _ = self.events.send(PlanEvent {
            plan_id: plan.id,
            state: plan.state,
        });
        Ok(())
    }

    pub fn load(&self, id: u64) -> Result<Plan> {
        match self.store.get(&Self::key(id))? {
            Some(v) => store::decode(&v.data),
            None => Err(LatticeError::UnknownPlan(id)),
        }
    }

    /// All persisted plans in id order.
    pub fn list(&self) -> Result<Vec<Plan>> {
        let mut plans = Vec::new();
        for key in self.store.list_keys(PLAN_PREFIX)? {
            if let Some(v) = self.store.get(&key)? {
                plans.push(store::decode(&v.data)?);
            }
        }
        Ok(plans)
    }

    /// Delete the oldest terminal plans beyond the retention limit. ERROR
    /// and INTERRUPTED plans are still resumable and never count against
    /// retention.
    pub fn prune(&self, retention: usize) -> Result<usize> {
        let terminal: Vec<Plan> = self
            .list()?
            .into_iter()
            .filter(|p| p.state.is_terminal())
            .collect();
        if terminal.len() <= retention {
            return Ok(0);
        }
        let excess = terminal.len() - retention;
        for plan in terminal.iter().take(excess) {
            self.store.delete(&Self::key(plan.id))?;
        }
        Ok(excess)
    }
}
