//! Configuration module for the Lattice orchestrator.

use crate::error::{LatticeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for an orchestrator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Task execution settings.
    pub execution: ExecutionConfig,
    /// Plan retention settings.
    pub retention: RetentionConfig,
    /// Durable store location. `None` selects the in-memory store.
    pub store_path: Option<PathBuf>,
}

/// Settings governing task execution against remote agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Retry budget for transient agent faults within one task.
    pub task_retry_limit: u32,
    /// Base backoff between retries; doubled per attempt, with jitter.
    pub retry_backoff: Duration,
    /// Upper bound on a single backoff sleep.
    pub max_backoff: Duration,
    /// Timeout applied to each agent RPC.
    pub rpc_timeout: Duration,
    /// Maximum leaf tasks executed concurrently inside a parallel group.
    pub max_parallel_tasks: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            task_retry_limit: 5,
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(10),
            max_parallel_tasks: 8,
        }
    }
}

/// Settings governing how long terminal plans are retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum terminal (SUCCEEDED/ERROR/CANCELED) plans to keep. The
    /// oldest are pruned when the limit is exceeded.
    pub plan_retention: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            plan_retention: 1000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionConfig::default(),
            retention: RetentionConfig::default(),
            store_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LatticeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| LatticeError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_tasks == 0 {
            return Err(LatticeError::InvalidConfig {
                field: "execution.max_parallel_tasks".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        if self.execution.rpc_timeout.is_zero() {
            return Err(LatticeError::InvalidConfig {
                field: "execution.rpc_timeout".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        if self.retention.plan_retention == 0 {
            return Err(LatticeError::InvalidConfig {
                field: "retention.plan_retention".to_string(),
                reason: "must retain at least one plan".to_string(),
            });
        }

        Ok(())
    }

    /// Create a configuration tuned for tests and local development:
    /// in-memory store, tight timeouts, small retry budget.
    pub fn development() -> Self {
        Self {
            execution: ExecutionConfig {
                task_retry_limit: 3,
                retry_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                rpc_timeout: Duration::from_secs(2),
                max_parallel_tasks: 4,
            },
            retention: RetentionConfig { plan_retention: 50 },
            store_path: None,
        }
    }
}
