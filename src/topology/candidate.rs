//! Topology candidates: named draft topologies awaiting deployment.

use super::Topology;
use crate::error::{LatticeError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A named, mutable draft topology. Candidates are independent of the
/// deployed topology and serve as the target side of a diff. A candidate is
/// consumed by exactly one deploy-topology plan and may be retained for
/// inspection afterward.
#[derive(Debug, Clone)]
pub struct TopologyCandidate {
    pub name: String,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub topology: Topology,
}

impl TopologyCandidate {
    pub fn new(name: impl Into<String>, topology: Topology) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            topology,
        }
    }
}

/// Store of candidates by name. Multiple candidates may exist concurrently.
#[derive(Debug, Default)]
pub struct CandidateStore {
    candidates: RwLock<HashMap<String, TopologyCandidate>>,
}

impl CandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate; replacing an existing name is rejected so an
    /// operator cannot silently clobber a reviewed draft.
    pub async fn add(&self, candidate: TopologyCandidate) -> Result<()> {
        let mut candidates = self.candidates.write().await;
        if candidates.contains_key(&candidate.name) {
            return Err(LatticeError::Validation(format!(
                "candidate {} already exists",
                candidate.name
            )));
        }
        candidates.insert(candidate.name.clone(), candidate);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<TopologyCandidate> {
        self.candidates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LatticeError::UnknownCandidate(name.to_string()))
    }

    pub async fn remove(&self, name: &str) -> Result<TopologyCandidate> {
        self.candidates
            .write()
            .await
            .remove(name)
            .ok_or_else(|| LatticeError::UnknownCandidate(name.to_string()))
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.candidates.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
