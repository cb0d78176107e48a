//! Lattice - the control plane of a partitioned, replicated key-value store.
//!
//! Lattice manages the shape of a sharded store: which zones exist, which
//! storage nodes host which replicas, where partitions live, and how the
//! cluster moves safely from one layout to the next. Data-path concerns
//! (client requests, replication streams) live elsewhere; Lattice only
//! orchestrates.
//!
//! # Features
//!
//! - **Versioned Topology Model**: Sequence-numbered snapshots of zones,
//!   storage nodes, shards, replicas, admins, and partitions.
//! - **Candidate Builder**: Initial placement, rebalance, redistribute,
//!   contract, targeted moves, and zone-type changes as named candidates.
//! - **Availability-Ordered Diff**: A pure structural diff ordered so no
//!   shard ever loses quorum at an intermediate step.
//! - **Restartable Plans**: Persisted task trees with idempotent replay,
//!   bounded retries, compensation, and interrupt support.
//! - **Verification & Repair**: Live-state verification and repair plans
//!   synthesized from what is actually broken.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        AdminService                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Candidates: Builder | Diff        Plans: Tasks | Executor   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Safety: Quorum Checks | Verification | Repair               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  State: Versioned Metadata Store    Remote: Node Agents      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use lattice::admin::AdminService;
//! use lattice::agent::AgentRegistry;
//! use lattice::config::OrchestratorConfig;
//! use lattice::types::ZoneType;
//!
//! #[tokio::main]
//! async fn main() -> lattice::Result<()> {
//!     let admin = AdminService::open(OrchestratorConfig::development(), AgentRegistry::new())?;
//!     let zone = admin.add_zone("zn1", 3, ZoneType::Primary, false)?;
//!     let sn = admin.add_storage_node(zone, "host1:5000", 1)?;
//!     admin.create_pool("pool1").await?;
//!     admin.add_pool_member("pool1", sn).await?;
//!     admin.create_candidate("first", "pool1", 100).await?;
//!     let plan = admin.create_deploy_topology_plan("deploy first", "first").await?;
//!     admin.approve_plan(plan)?;
//!     admin.execute_plan(plan).await?;
//!     admin.assert_success(plan)
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod admin;
pub mod agent;
pub mod faults;
pub mod plan;
pub mod quorum;
pub mod store;
pub mod topology;
pub mod verify;

pub use admin::AdminService;
pub use error::{LatticeError, Result};
pub use plan::{Plan, PlanState};
pub use topology::Topology;
