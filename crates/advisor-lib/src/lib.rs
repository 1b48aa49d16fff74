//! Node-local QoS resource advisor library
//!
//! This crate provides the core functionality for:
//! - Partitioning containers into QoS regions over the NUMA topology
//! - Per-region provision and headroom policies (canonical, PID)
//! - Assembling region outputs into named cpu pools per NUMA node
//! - Reclaimable memory headroom calculation
//! - Checkpointing, health checks and observability

pub mod advisor;
pub mod assembler;
pub mod asyncworker;
pub mod checkpoint;
pub mod healthz;
pub mod isolation;
pub mod kubelet;
pub mod machine;
pub mod memory;
pub mod metacache;
pub mod metric;
pub mod models;
pub mod observability;
pub mod podresources;
pub mod region;

pub use advisor::{CpuAdvisorConfig, CpuResourceAdvisor};
pub use healthz::{HealthCheckResult, HealthCheckState, HealthRegistry};
pub use memory::{MemoryHeadroomConfig, MemoryResourceAdvisor};
pub use metacache::MetaCache;
pub use models::*;
pub use observability::AdvisorMetrics;
