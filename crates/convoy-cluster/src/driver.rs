//! Collaborator capabilities consumed by the orchestrator
//!
//! The scheduler, volume driver and node driver perform the actual Kubernetes
//! object creation, deletion and volume provisioning. The orchestrator only
//! sequences and tracks their calls, so each one is a trait here and tests
//! substitute mocks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_common::Result;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::spec::AppSpec;

/// Reference to one scheduled application instance
///
/// Returned by [`Scheduler::schedule_with_custom_specs`] and owned by exactly
/// one namespace of one cluster controller until it is destroyed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHandle {
    /// Unique id assigned by the scheduler
    pub uid: String,
    /// Rewritten app-key of the scheduled application (e.g. "postgres-3-0")
    pub app_key: String,
    /// Namespace the application was scheduled into
    pub namespace: String,
    /// Skip volume checks during validate and destroy
    #[serde(default)]
    pub skip_volume_validation: bool,
    /// Ask the volume driver to refresh its endpoint when validating volumes
    #[serde(default)]
    pub refresh_storage_endpoint: bool,
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app-key [{}], uid [{}], namespace [{}]",
            self.app_key, self.uid, self.namespace
        )
    }
}

/// Volume owned by a scheduled application
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Volume id in the storage system
    pub id: String,
    /// Volume (claim) name
    pub name: String,
    /// Namespace of the claim
    pub namespace: String,
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.id)
    }
}

/// Cluster node as reported by the scheduler
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node name
    pub name: String,
}

impl Node {
    /// Create a node reference by name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Volume parameters keyed by volume name
pub type VolumeParameters = BTreeMap<String, BTreeMap<String, String>>;

/// Options for a scheduling call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// App-keys as requested, before name rewriting
    pub app_keys: Vec<String>,
    /// Target namespace
    pub namespace: String,
    /// Storage provisioner for volumes
    pub storage_provisioner: String,
    /// Candidate nodes
    pub nodes: Vec<Node>,
    /// Node labels the applications must be placed by
    pub labels: BTreeMap<String, String>,
}

/// Options for destroying a scheduled application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestroyOptions {
    /// Wait until the resources are gone
    pub wait_for_destroy: bool,
    /// Wait until resource-leak cleanup completes
    pub wait_for_resource_leak_cleanup: bool,
    /// Leave cluster-scoped objects in place
    pub skip_cluster_scoped_objects: bool,
}

/// Options for deleting the volumes of a scheduled application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeOptions {
    /// Only delete namespace-scoped objects
    pub skip_cluster_scoped_objects: bool,
}

/// Workload scheduler of the active cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Load the kubeconfig at `config_path` as the active configuration
    ///
    /// An empty path selects the cluster this process runs in.
    async fn set_config(&self, config_path: &str) -> Result<()>;

    /// Re-read the node list of the active cluster
    async fn refresh_node_registry(&self) -> Result<()>;

    /// Create the given specs in `options.namespace`
    async fn schedule_with_custom_specs(
        &self,
        specs: Vec<AppSpec>,
        instance_id: &str,
        options: &ScheduleOptions,
    ) -> Result<Vec<ResourceHandle>>;

    /// Block until the application is running or `timeout` elapses
    async fn wait_for_running(
        &self,
        handle: &ResourceHandle,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<()>;

    /// Check the application was placed according to the topology labels
    async fn validate_topology_label(&self, handle: &ResourceHandle) -> Result<()>;

    /// Check the application's volumes are bound and healthy
    async fn validate_volumes(
        &self,
        handle: &ResourceHandle,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<()>;

    /// Storage parameters of each volume of the application
    async fn get_volume_parameters(&self, handle: &ResourceHandle) -> Result<VolumeParameters>;

    /// Volumes of the application
    async fn get_volumes(&self, handle: &ResourceHandle) -> Result<Vec<VolumeRef>>;

    /// Delete the application's volumes, returning what was deleted
    async fn delete_volumes(
        &self,
        handle: &ResourceHandle,
        options: &VolumeOptions,
    ) -> Result<Vec<VolumeRef>>;

    /// Delete the application
    async fn destroy(&self, handle: &ResourceHandle, options: &DestroyOptions) -> Result<()>;

    /// Set a label on a node
    async fn add_label_on_node(&self, node: &Node, key: &str, value: &str) -> Result<()>;

    /// Nodes of the active cluster that carry no storage
    async fn get_storage_less_nodes(&self) -> Result<Vec<Node>>;

    /// Read the volume auth token from the named config map
    async fn get_token_from_config_map(&self, config_map: &str) -> Result<String>;
}

/// Storage driver of the active cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Re-resolve the driver's endpoints after a context switch
    async fn refresh_driver_endpoints(&self) -> Result<()>;

    /// Check a volume was created with the given parameters
    async fn validate_create_volume(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Check a volume is attached and usable
    async fn validate_volume_setup(&self, volume: &VolumeRef) -> Result<()>;

    /// Check a volume no longer exists
    async fn validate_delete_volume(&self, volume: &VolumeRef) -> Result<()>;
}

/// Node access driver
///
/// Only SSH-based drivers can follow a context switch; any other kind makes
/// the switch fail.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// Driver name for diagnostics
    fn name(&self) -> String;

    /// Whether this is an SSH-based driver
    fn is_ssh(&self) -> bool;

    /// Reconnect to the nodes of the active cluster
    async fn refresh(&self) -> Result<()>;
}

/// Resolves app-keys to application templates
#[cfg_attr(test, automock)]
pub trait SpecFactory: Send + Sync {
    /// Template registered under `app_key`
    fn get(&self, app_key: &str) -> Result<Arc<AppSpec>>;
}

/// The collaborator set every cluster-scoped call goes through
#[derive(Clone)]
pub struct Drivers {
    /// Workload scheduler
    pub scheduler: Arc<dyn Scheduler>,
    /// Storage driver
    pub volume: Arc<dyn VolumeDriver>,
    /// Node access driver
    pub node: Arc<dyn NodeDriver>,
    /// Application template source
    pub specs: Arc<dyn SpecFactory>,
}

impl Drivers {
    /// Bundle the collaborators
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        volume: Arc<dyn VolumeDriver>,
        node: Arc<dyn NodeDriver>,
        specs: Arc<dyn SpecFactory>,
    ) -> Self {
        Self {
            scheduler,
            volume,
            node,
            specs,
        }
    }
}

impl fmt::Debug for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}
