//! Multi-cluster application scheduling for convoy
//!
//! Test code schedules application templates into namespaces of one or more
//! clusters, validates they came up healthy and tears them down again:
//!
//! - [`ClusterRegistry`] holds the cluster identities of a run and builds one
//!   [`ClusterController`] per cluster.
//! - [`ClusterSession`] owns the scheduler, volume driver and node driver and
//!   switches them between clusters; every cluster-scoped call goes through
//!   the [`ActiveCluster`] guard it returns.
//! - [`ScheduleApplicationsConfig`] schedules renamed copies of the templates.
//! - [`NamespaceConfig`] validates or destroys what a namespace holds.

pub mod controller;
pub mod descriptor;
pub mod driver;
pub mod namespace;
pub mod schedule;
pub mod session;
pub mod spec;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ClusterController, NamespaceInfo};
pub use descriptor::{ClusterDescriptor, ClusterRegistry};
pub use driver::{
    DestroyOptions, Drivers, Node, NodeDriver, ResourceHandle, ScheduleOptions, Scheduler,
    SpecFactory, VolumeDriver, VolumeOptions, VolumeParameters, VolumeRef,
};
pub use namespace::NamespaceConfig;
pub use schedule::ScheduleApplicationsConfig;
pub use session::{ActiveCluster, ClusterSession};
pub use spec::{AppSpec, Nameable, SpecCatalog, SpecObject};
pub use stats::{ExecutionRecord, Operation};

// Re-export common error types
pub use convoy_common::{Error, OrchestratorConfig, Result, ResultExt};
