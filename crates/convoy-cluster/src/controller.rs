//! Per-cluster controller and its bookkeeping
//!
//! A [`ClusterController`] tracks which resource handles were scheduled into
//! which namespace of its cluster and how often each app-key was scheduled.
//! The app-key counts, together with the cluster id, are the only source of
//! name uniqueness: a count is read and incremented as one step and is never
//! decremented outside a successful [`ClusterController::cleanup`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use convoy_common::{
    Error, OrchestratorConfig, Result, ResultExt, DEFAULT_STORAGE_LESS_NODE_LABEL,
    IN_CLUSTER_CONFIG_PATH,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::descriptor::ClusterDescriptor;
use crate::driver::ResourceHandle;
use crate::namespace::NamespaceConfig;
use crate::schedule::ScheduleApplicationsConfig;
use crate::session::{ActiveCluster, ClusterSession};
use crate::stats::{ExecutionRecord, Operation};

/// What a controller knows about one namespace
#[derive(Clone, Debug, Default)]
pub struct NamespaceInfo {
    /// Live handles, in scheduling order
    pub handles: Vec<ResourceHandle>,
    /// Handles destroyed so far
    pub destroyed: Vec<ResourceHandle>,
    /// Validate, destroy and cleanup outcomes
    pub executions: Vec<ExecutionRecord>,
}

/// Live controller of one cluster
pub struct ClusterController {
    descriptor: ClusterDescriptor,
    session: Arc<ClusterSession>,
    namespaces: RwLock<BTreeMap<String, NamespaceInfo>>,
    app_key_counts: RwLock<HashMap<String, u64>>,
}

impl ClusterController {
    /// Build the controller for `descriptor`
    ///
    /// Non-hyper-converged clusters must expose storage-less nodes; each one is
    /// labelled with the descriptor's storage-less labels, or the default
    /// label when none are declared.
    pub async fn new(mut descriptor: ClusterDescriptor, session: Arc<ClusterSession>) -> Result<Self> {
        if !descriptor.hyper_converged {
            let labels = if descriptor.storage_less_node_labels.is_empty() {
                let (key, value) = DEFAULT_STORAGE_LESS_NODE_LABEL;
                BTreeMap::from([(key.to_string(), value.to_string())])
            } else {
                descriptor.storage_less_node_labels.clone()
            };

            let active = session
                .switch_to(&descriptor.config_path)
                .await
                .traced_with(|| descriptor.to_string())?;
            let nodes = active
                .scheduler()
                .get_storage_less_nodes()
                .await
                .traced_with(|| descriptor.to_string())?;
            if nodes.is_empty() {
                return Err(Error::NoStorageLessNodes {
                    cluster: descriptor.name.clone(),
                    config_path: descriptor.config_path.clone(),
                });
            }

            for node in &nodes {
                for (key, value) in &labels {
                    active
                        .scheduler()
                        .add_label_on_node(node, key, value)
                        .await
                        .map_err(|source| Error::NodeLabel {
                            node: node.name.clone(),
                            config_path: descriptor.config_path.clone(),
                            key: key.clone(),
                            value: value.clone(),
                            source: Box::new(source),
                        })?;
                }
            }
            drop(active);

            info!(
                cluster = %descriptor.name,
                nodes = nodes.len(),
                labels = ?labels,
                "Labelled storage-less nodes"
            );
            descriptor.storage_less_node_labels = labels;
            descriptor.storage_less_nodes = nodes;
        }

        debug!(cluster = %descriptor, "Created cluster controller");
        Ok(Self {
            descriptor,
            session,
            namespaces: RwLock::new(BTreeMap::new()),
            app_key_counts: RwLock::new(HashMap::new()),
        })
    }

    /// Snapshot of the cluster identity
    pub fn descriptor(&self) -> &ClusterDescriptor {
        &self.descriptor
    }

    /// Cluster id embedded in generated names
    pub fn id(&self) -> u32 {
        self.descriptor.id
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Session shared with the other controllers
    pub fn session(&self) -> &Arc<ClusterSession> {
        &self.session
    }

    /// Orchestrator configuration
    pub fn config(&self) -> &OrchestratorConfig {
        self.session.config()
    }

    /// Point the collaborators at this cluster
    pub async fn switch_context(&self) -> Result<ActiveCluster<'_>> {
        self.session
            .switch_to(&self.descriptor.config_path)
            .await
            .traced_with(|| self.descriptor.to_string())
    }

    /// Tracked info of `namespace`; empty when never scheduled
    pub fn get_namespace_info(&self, namespace: &str) -> NamespaceInfo {
        self.namespaces
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the tracked info of `namespace`
    pub fn save_namespace_info(&self, namespace: &str, info: NamespaceInfo) {
        self.namespaces.write().insert(namespace.to_string(), info);
    }

    /// Stop tracking `namespace`
    pub fn delete_namespace_info(&self, namespace: &str) {
        self.namespaces.write().remove(namespace);
    }

    /// Whether `namespace` was ever scheduled on this cluster
    pub fn is_namespace_tracked(&self, namespace: &str) -> bool {
        self.namespaces.read().contains_key(namespace)
    }

    /// Tracked namespaces in sorted order
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// How often `app_key` was scheduled since the last cleanup
    pub fn get_app_key_count(&self, app_key: &str) -> u64 {
        self.app_key_counts.read().get(app_key).copied().unwrap_or(0)
    }

    /// Count one more scheduling of `app_key`
    pub fn increment_app_key_count(&self, app_key: &str) {
        self.next_app_key_index(app_key);
    }

    /// Read the count of `app_key` and increment it as one step
    ///
    /// The returned index is the zero-based ordinal of this scheduling.
    pub fn next_app_key_index(&self, app_key: &str) -> u64 {
        let mut counts = self.app_key_counts.write();
        let count = counts.entry(app_key.to_string()).or_insert(0);
        let index = *count;
        *count += 1;
        index
    }

    /// Append freshly scheduled handles to `namespace`
    pub fn record_handles(&self, namespace: &str, handles: &[ResourceHandle]) {
        let mut namespaces = self.namespaces.write();
        let info = namespaces.entry(namespace.to_string()).or_default();
        info.handles.extend_from_slice(handles);
        debug!(
            cluster = %self.descriptor.name,
            namespace,
            added = handles.len(),
            tracked = info.handles.len(),
            "Recorded resource handles"
        );
    }

    /// Move the handles with the given uids to the destroyed history
    ///
    /// The namespace stays tracked even when no live handle remains.
    pub fn forget_handles(&self, namespace: &str, uids: &[String]) {
        let mut namespaces = self.namespaces.write();
        let info = namespaces.entry(namespace.to_string()).or_default();
        let (destroyed, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut info.handles)
            .into_iter()
            .partition(|handle| uids.contains(&handle.uid));
        info.handles = remaining;
        info.destroyed.extend(destroyed);
    }

    /// Attach an execution record to its namespace
    pub fn record_execution(&self, record: ExecutionRecord) {
        let mut namespaces = self.namespaces.write();
        namespaces
            .entry(record.namespace.clone())
            .or_default()
            .executions
            .push(record);
    }

    /// Schedule request for one app-key on this cluster
    pub fn application(&self, app_key: impl Into<String>) -> ScheduleApplicationsConfig {
        self.multiple_applications(vec![app_key.into()])
    }

    /// Schedule request for several app-keys on this cluster
    pub fn multiple_applications(&self, app_keys: Vec<String>) -> ScheduleApplicationsConfig {
        let config = self.config();
        ScheduleApplicationsConfig::new(app_keys)
            .storage_provisioner(&config.provisioner)
            .instance_id(&config.instance_id)
            .nodes(self.descriptor.storage_less_nodes.clone())
            .labels(self.descriptor.storage_less_node_labels.clone())
            .for_cluster(self.name())
    }

    /// Validate or destroy request for one namespace of this cluster
    pub fn select_namespace(&self, namespace: impl Into<String>) -> NamespaceConfig {
        NamespaceConfig::new(namespace, self.config())
    }

    /// Destroy every tracked namespace and reset the app-key counts
    ///
    /// Stops at the first namespace that fails to destroy; the rest stay
    /// tracked. Counts are reset only when every namespace was destroyed. In
    /// either case the statistics are logged and the session is switched back
    /// to the in-cluster context.
    pub async fn cleanup(&self) -> Result<()> {
        info!(cluster = %self.descriptor.name, "Cleaning up cluster");
        let destroyed = self.destroy_namespaces().await;
        if destroyed.is_ok() {
            self.app_key_counts.write().clear();
        }

        self.print_stats();

        let switched = self
            .session
            .switch_to(IN_CLUSTER_CONFIG_PATH)
            .await
            .map(|_| ())
            .traced();

        match (destroyed, switched) {
            (Err(err), Err(switch_err)) => {
                warn!(
                    cluster = %self.descriptor.name,
                    error = %switch_err,
                    "Failed to switch back to the in-cluster context after a failed cleanup"
                );
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), switched) => switched,
        }
    }

    async fn destroy_namespaces(&self) -> Result<()> {
        for namespace in self.namespaces() {
            let record = ExecutionRecord::start(Operation::Cleanup, &namespace);
            let result = self
                .select_namespace(&namespace)
                .skip_precondition_check()
                .destroy(self)
                .await;
            self.record_execution(record.finish(result.is_ok()));
            result.traced_with(|| format!("cluster [{}] namespace [{}]", self.name(), namespace))?;
        }
        Ok(())
    }

    /// Log the handles and execution records of every tracked namespace
    pub fn print_stats(&self) {
        let namespaces = self.namespaces.read();
        for (namespace, info) in namespaces.iter() {
            info!(
                cluster = %self.descriptor.name,
                namespace = %namespace,
                live = info.handles.len(),
                destroyed = info.destroyed.len(),
                "Namespace statistics"
            );
            for record in &info.executions {
                info!(
                    cluster = %self.descriptor.name,
                    operation = %record.operation,
                    status = record.status(),
                    duration_ms = record.duration.as_millis() as u64,
                    "{}",
                    record
                );
            }
        }
    }
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("descriptor", &self.descriptor)
            .field("namespaces", &self.namespaces.read().len())
            .finish_non_exhaustive()
    }
}
