//! Cluster identities and the registry controllers are built from

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use convoy_common::config::ClusterEntry;
use convoy_common::{Error, OrchestratorConfig, Result, ResultExt, IN_CLUSTER_CONFIG_PATH};
use tracing::debug;

use crate::controller::ClusterController;
use crate::driver::Node;
use crate::session::ClusterSession;

/// Identity of one cluster
///
/// A controller takes a snapshot of its descriptor at construction; later
/// changes to the registry entry do not reach a live controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescriptor {
    /// Identifier embedded in generated names
    pub id: u32,
    /// Unique name, the registry key
    pub name: String,
    /// Kubeconfig path; empty for the cluster this process runs in
    pub config_path: String,
    /// The cluster this process runs in
    pub in_cluster: bool,
    /// Compute and storage share the same nodes
    pub hyper_converged: bool,
    /// Labels applied to storage-less nodes
    pub storage_less_node_labels: BTreeMap<String, String>,
    /// Storage-less nodes discovered when the controller was built
    pub storage_less_nodes: Vec<Node>,
}

impl ClusterDescriptor {
    /// Describe a hyper-converged cluster reached through `config_path`
    pub fn new(id: u32, name: impl Into<String>, config_path: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            config_path: config_path.into(),
            in_cluster: false,
            hyper_converged: true,
            storage_less_node_labels: BTreeMap::new(),
            storage_less_nodes: Vec::new(),
        }
    }

    /// Mark this as the cluster the process runs in
    pub fn in_cluster(mut self) -> Self {
        self.in_cluster = true;
        self.config_path = IN_CLUSTER_CONFIG_PATH.to_string();
        self
    }

    /// Set whether compute and storage share nodes
    pub fn hyper_converged(mut self, hyper_converged: bool) -> Self {
        self.hyper_converged = hyper_converged;
        self
    }

    /// Labels to apply to storage-less nodes
    pub fn storage_less_node_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.storage_less_node_labels = labels;
        self
    }

    /// Build the live controller for this cluster
    pub async fn controller(&self, session: Arc<ClusterSession>) -> Result<ClusterController> {
        ClusterController::new(self.clone(), session).await
    }
}

impl From<&ClusterEntry> for ClusterDescriptor {
    fn from(entry: &ClusterEntry) -> Self {
        let descriptor = ClusterDescriptor::new(entry.id, &entry.name, &entry.config_path)
            .hyper_converged(entry.hyper_converged)
            .storage_less_node_labels(entry.storage_less_node_labels.clone());
        if entry.in_cluster {
            descriptor.in_cluster()
        } else {
            descriptor
        }
    }
}

impl fmt::Display for ClusterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster [{}] id [{}] config-path [{}] in-cluster [{}] hyper-converged [{}]",
            self.name, self.id, self.config_path, self.in_cluster, self.hyper_converged
        )
    }
}

/// Clusters of a run, keyed by name
#[derive(Clone, Debug, Default)]
pub struct ClusterRegistry {
    clusters: BTreeMap<String, ClusterDescriptor>,
}

impl ClusterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the configured cluster entries
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let mut registry = Self::new();
        for entry in &config.clusters {
            registry.add(ClusterDescriptor::from(entry))?;
        }
        Ok(registry)
    }

    /// Register a cluster; names and ids must be unique
    pub fn add(&mut self, descriptor: ClusterDescriptor) -> Result<()> {
        if self.clusters.contains_key(&descriptor.name) {
            return Err(Error::DuplicateCluster {
                field: "name",
                value: descriptor.name,
            });
        }
        if self.clusters.values().any(|c| c.id == descriptor.id) {
            return Err(Error::DuplicateCluster {
                field: "id",
                value: descriptor.id.to_string(),
            });
        }
        debug!(cluster = %descriptor, "Registered cluster");
        self.clusters.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Descriptor registered under `name`
    pub fn get(&self, name: &str) -> Result<&ClusterDescriptor> {
        self.clusters.get(name).ok_or_else(|| Error::ClusterNotFound {
            name: name.to_string(),
        })
    }

    /// Mutable descriptor registered under `name`
    pub fn get_mut(&mut self, name: &str) -> Result<&mut ClusterDescriptor> {
        self.clusters
            .get_mut(name)
            .ok_or_else(|| Error::ClusterNotFound {
                name: name.to_string(),
            })
    }

    /// Registered cluster names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.clusters.keys().cloned().collect()
    }

    /// Number of registered clusters
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether no cluster is registered
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Build one controller per registered cluster, keyed by name
    pub async fn controllers(
        &self,
        session: &Arc<ClusterSession>,
    ) -> Result<BTreeMap<String, Arc<ClusterController>>> {
        let mut controllers = BTreeMap::new();
        for (name, descriptor) in &self.clusters {
            let controller = descriptor
                .controller(Arc::clone(session))
                .await
                .traced_with(|| descriptor.to_string())?;
            controllers.insert(name.clone(), Arc::new(controller));
        }
        Ok(controllers)
    }
}
