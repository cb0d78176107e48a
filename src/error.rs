//! Error types for the Lattice control plane.
//!
//! This module provides a unified error type [`LatticeError`] for all
//! orchestrator operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! Errors are organized into the following categories:
//!
//! - **Validation**: static problems detected at candidate or plan-creation
//!   time (bad parameters, unsafe replication-factor reduction, unknown pool)
//! - **Precondition**: quorum or majority would be lost if the operation ran
//! - **Remote**: faults talking to a storage-node agent, split into
//!   transient (retried) and permanent (aborts the task)
//! - **Inconsistency**: a task's cleanup failed or was skipped, leaving
//!   state that only verification and a repair plan can reconcile
//! - **Storage/Config/Serialization**: ambient infrastructure failures
//!
//! # Example
//!
//! ```rust
//! use lattice::error::{LatticeError, Result};
//!
//! fn check_rf(rf: u32) -> Result<()> {
//!     if rf < 1 {
//!         return Err(LatticeError::Validation(
//!             "replication factor must be at least 1".into(),
//!         ));
//!     }
//!     Ok(())
//! }
//!
//! fn handle(err: &LatticeError) {
//!     if err.is_retryable() {
//!         println!("retrying...");
//!     } else {
//!         println!("fatal: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for Lattice operations.
#[derive(Error, Debug)]
pub enum LatticeError {
    // Static validation errors (plan/candidate creation time)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown candidate: {0}")]
    UnknownCandidate(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    #[error("Unknown plan: {0}")]
    UnknownPlan(u64),

    // Execution-time precondition violations
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Quorum not reachable: got {got}, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    // Remote agent faults
    #[error("Transient agent fault on {node}: {reason}")]
    RemoteTransient { node: String, reason: String },

    #[error("Permanent agent fault on {node}: {reason}")]
    RemotePermanent { node: String, reason: String },

    #[error("Agent RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("No agent registered for storage node {0}")]
    NoAgent(String),

    // Plan lifecycle errors
    #[error("Illegal plan transition: plan {plan_id} is {state}, cannot {action}")]
    IllegalPlanState {
        plan_id: u64,
        state: String,
        action: String,
    },

    #[error("Plan {plan_id} ended {state}: {cause}")]
    PlanFailed {
        plan_id: u64,
        state: String,
        cause: String,
    },

    #[error("Not the master; plan operations require the elected master")]
    NotMaster,

    #[error("Conflict: {0}")]
    Conflict(String),

    // Residual inconsistency (cleanup failed or was skipped)
    #[error("Internal inconsistency: {0}")]
    Inconsistency(String),

    // Storage substrate errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("RocksDB error: {0}")]
    RocksDb(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LatticeError {
    /// Check if the error is retryable within a task's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LatticeError::RemoteTransient { .. }
                | LatticeError::RpcTimeout(_)
                | LatticeError::Conflict(_)
        )
    }

    /// Root-cause class name carried by `assert_success` so callers can
    /// distinguish expected failures from genuine bugs.
    pub fn class(&self) -> &'static str {
        match self {
            LatticeError::Validation(_)
            | LatticeError::InvalidConfig { .. }
            | LatticeError::Config(_)
            | LatticeError::UnknownCandidate(_)
            | LatticeError::UnknownPool(_)
            | LatticeError::UnknownPlan(_) => "ValidationError",
            LatticeError::PreconditionFailed(_) | LatticeError::QuorumNotReached { .. } => {
                "PreconditionViolation"
            }
            LatticeError::RemoteTransient { .. }
            | LatticeError::RpcTimeout(_)
            | LatticeError::NoAgent(_) => "RemoteFault(transient)",
            LatticeError::RemotePermanent { .. } => "RemoteFault(permanent)",
            LatticeError::Inconsistency(_) => "InternalInconsistency",
            LatticeError::IllegalPlanState { .. }
            | LatticeError::PlanFailed { .. }
            | LatticeError::NotMaster
            | LatticeError::Conflict(_) => "PlanFault",
            _ => "InternalError",
        }
    }
}

impl From<rocksdb::Error> for LatticeError {
    fn from(e: rocksdb::Error) -> Self {
        LatticeError::RocksDb(e.to_string())
    }
}

impl From<bincode::Error> for LatticeError {
    fn from(e: bincode::Error) -> Self {
        LatticeError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for LatticeError {
    fn from(e: serde_json::Error) -> Self {
        LatticeError::Serialization(e.to_string())
    }
}

/// Result type alias for Lattice operations.
pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(LatticeError::RemoteTransient {
            node: "sn1".into(),
            reason: "connection refused".into()
        }
        .is_retryable());
        assert!(LatticeError::RpcTimeout(500).is_retryable());
        assert!(!LatticeError::RemotePermanent {
            node: "sn1".into(),
            reason: "version mismatch".into()
        }
        .is_retryable());
        assert!(!LatticeError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            LatticeError::UnknownPool("p".into()).class(),
            "ValidationError"
        );
        assert_eq!(
            LatticeError::QuorumNotReached { got: 1, need: 2 }.class(),
            "PreconditionViolation"
        );
        assert_eq!(
            LatticeError::Inconsistency("orphan".into()).class(),
            "InternalInconsistency"
        );
    }
}
