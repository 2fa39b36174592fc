//! Process-wide orchestration configuration
//!
//! Loaded once per test run, from a JSON file named by `CONVOY_CONFIG` with
//! individual environment variables layered on top:
//! - `CONVOY_PROVISIONER`: storage provisioner passed to the scheduler
//! - `CONVOY_INSTANCE_ID`: identity attached to every scheduled application
//! - `CONVOY_SPEC_DIR`: directory holding application templates
//! - `CONVOY_CONFIG_MAP`: config map holding the volume auth token
//! - `CONVOY_KUBECONFIGS`: comma-separated kubeconfig paths, used only when
//!   the file lists no clusters; each becomes a cluster named after its file,
//!   or after its directory when several files share a name

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

const CONFIG_ENV: &str = "CONVOY_CONFIG";
const PROVISIONER_ENV: &str = "CONVOY_PROVISIONER";
const INSTANCE_ID_ENV: &str = "CONVOY_INSTANCE_ID";
const SPEC_DIR_ENV: &str = "CONVOY_SPEC_DIR";
const CONFIG_MAP_ENV: &str = "CONVOY_CONFIG_MAP";
const KUBECONFIGS_ENV: &str = "CONVOY_KUBECONFIGS";

/// Default time to wait for an application to reach the running state
pub const DEFAULT_WAIT_FOR_RUNNING_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Default interval between running-state checks
pub const DEFAULT_WAIT_FOR_RUNNING_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Default time to wait for volume validation
pub const DEFAULT_VALIDATE_VOLUME_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Default interval between volume validation checks
pub const DEFAULT_VALIDATE_VOLUME_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Top-level configuration shared by every cluster controller
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Storage provisioner name handed to the scheduler
    pub provisioner: String,
    /// Identity of this test run, attached to scheduled applications
    pub instance_id: String,
    /// Directory holding application templates, one sub-directory per app-key
    pub spec_dir: Option<String>,
    /// Topology labels; validation of them is enabled when non-empty
    pub topology_labels: BTreeMap<String, String>,
    /// Config map holding the volume auth token, if the volume driver needs one
    pub config_map: Option<String>,
    /// Validation timeouts
    pub timeouts: TimeoutConfig,
    /// Default destroy behavior
    pub destroy: DestroyDefaults,
    /// Clusters available to the run
    pub clusters: Vec<ClusterEntry>,
}

/// Timeouts for wait-for-running and volume validation, in seconds
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Seconds to wait for an application to start running
    pub wait_for_running_secs: u64,
    /// Seconds between running-state checks
    pub wait_for_running_interval_secs: u64,
    /// Seconds to wait for volume validation
    pub validate_volume_secs: u64,
    /// Seconds between volume validation checks
    pub validate_volume_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            wait_for_running_secs: DEFAULT_WAIT_FOR_RUNNING_TIMEOUT.as_secs(),
            wait_for_running_interval_secs: DEFAULT_WAIT_FOR_RUNNING_RETRY_INTERVAL.as_secs(),
            validate_volume_secs: DEFAULT_VALIDATE_VOLUME_TIMEOUT.as_secs(),
            validate_volume_interval_secs: DEFAULT_VALIDATE_VOLUME_RETRY_INTERVAL.as_secs(),
        }
    }
}

impl TimeoutConfig {
    /// Time to wait for an application to start running
    pub fn wait_for_running_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_for_running_secs)
    }

    /// Interval between running-state checks
    pub fn wait_for_running_retry_interval(&self) -> Duration {
        Duration::from_secs(self.wait_for_running_interval_secs)
    }

    /// Time to wait for volume validation
    pub fn validate_volume_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_volume_secs)
    }

    /// Interval between volume validation checks
    pub fn validate_volume_retry_interval(&self) -> Duration {
        Duration::from_secs(self.validate_volume_interval_secs)
    }
}

/// Default options applied when destroying applications
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DestroyDefaults {
    /// Wait until the scheduler reports the resources gone
    pub wait_for_destroy: bool,
    /// Wait until the scheduler finishes resource-leak cleanup
    pub wait_for_resource_leak_cleanup: bool,
    /// Leave cluster-scoped objects (storage classes, cluster roles) in place
    pub skip_cluster_scoped_objects: bool,
}

impl Default for DestroyDefaults {
    fn default() -> Self {
        Self {
            wait_for_destroy: true,
            wait_for_resource_leak_cleanup: true,
            skip_cluster_scoped_objects: false,
        }
    }
}

/// One cluster as declared in configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterEntry {
    /// Identifier embedded in generated names
    pub id: u32,
    /// Human-readable name, unique within the run
    pub name: String,
    /// Kubeconfig path; ignored for in-cluster entries
    pub config_path: String,
    /// The cluster this process runs in
    pub in_cluster: bool,
    /// Compute and storage share the same nodes
    pub hyper_converged: bool,
    /// Labels applied to storage-less nodes of non-hyper-converged clusters
    pub storage_less_node_labels: BTreeMap<String, String>,
}

impl Default for ClusterEntry {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            config_path: String::new(),
            in_cluster: false,
            hyper_converged: true,
            storage_less_node_labels: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
        debug!(
            path = %path.display(),
            clusters = config.clusters.len(),
            "Loaded orchestrator configuration"
        );
        Ok(config)
    }

    /// Load configuration from `CONVOY_CONFIG` and overlay environment variables
    ///
    /// Without `CONVOY_CONFIG` the defaults are used as the base.
    pub fn from_env() -> Result<Self> {
        let mut config = match non_empty_env(CONFIG_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(non_empty_env);
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provisioner) = lookup(PROVISIONER_ENV) {
            self.provisioner = provisioner;
        }
        if let Some(instance_id) = lookup(INSTANCE_ID_ENV) {
            self.instance_id = instance_id;
        }
        if let Some(spec_dir) = lookup(SPEC_DIR_ENV) {
            self.spec_dir = Some(spec_dir);
        }
        if let Some(config_map) = lookup(CONFIG_MAP_ENV) {
            self.config_map = Some(config_map);
        }
        if self.clusters.is_empty() {
            if let Some(kubeconfigs) = lookup(KUBECONFIGS_ENV) {
                self.clusters = clusters_from_kubeconfigs(&kubeconfigs);
            }
        }
    }
}

/// One hyper-converged entry per kubeconfig path, named after the file
///
/// File names shared by several paths (usually `config`) are replaced with
/// `<parent-dir>-<index>`, or `cluster-<index>` at the filesystem root.
fn clusters_from_kubeconfigs(kubeconfigs: &str) -> Vec<ClusterEntry> {
    let paths: Vec<&str> = kubeconfigs
        .split(',')
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .collect();
    let file_names: Vec<String> = paths
        .iter()
        .map(|path| {
            Path::new(path)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string())
        })
        .collect();

    paths
        .iter()
        .zip(&file_names)
        .enumerate()
        .map(|(index, (path, file_name))| {
            let shared = file_names.iter().filter(|other| *other == file_name).count() > 1;
            let name = if shared {
                let parent = Path::new(path)
                    .parent()
                    .and_then(Path::file_name)
                    .map(|dir| dir.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "cluster".to_string());
                format!("{}-{}", parent, index)
            } else {
                file_name.clone()
            };
            ClusterEntry {
                id: index as u32,
                name,
                config_path: path.to_string(),
                ..Default::default()
            }
        })
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_match_orchestrator_conventions() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.timeouts.wait_for_running_timeout(),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.timeouts.wait_for_running_retry_interval(),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.timeouts.validate_volume_timeout(),
            Duration::from_secs(600)
        );
        assert!(config.destroy.wait_for_destroy);
        assert!(config.destroy.wait_for_resource_leak_cleanup);
        assert!(!config.destroy.skip_cluster_scoped_objects);
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn load_reads_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "provisioner": "pxd",
                "instanceId": "run-42",
                "timeouts": {{ "waitForRunningSecs": 30 }},
                "clusters": [
                    {{ "id": 0, "name": "source", "inCluster": true }},
                    {{ "id": 1, "name": "destination", "configPath": "/kube/dest",
                       "hyperConverged": false,
                       "storageLessNodeLabels": {{ "storage": "none" }} }}
                ]
            }}"#
        )
        .unwrap();

        let config = OrchestratorConfig::load(file.path()).unwrap();
        assert_eq!(config.provisioner, "pxd");
        assert_eq!(config.instance_id, "run-42");
        assert_eq!(
            config.timeouts.wait_for_running_timeout(),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.timeouts.wait_for_running_retry_interval(),
            Duration::from_secs(10)
        );
        assert_eq!(config.clusters.len(), 2);
        assert!(config.clusters[0].in_cluster);
        assert!(config.clusters[0].hyper_converged);
        assert!(!config.clusters[1].hyper_converged);
        assert_eq!(
            config.clusters[1].storage_less_node_labels.get("storage"),
            Some(&"none".to_string())
        );
    }

    #[test]
    fn load_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = OrchestratorConfig::load(file.path()).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = OrchestratorConfig::load("/nonexistent/convoy.json").unwrap_err();
        assert!(err.to_string().contains("failed to read /nonexistent/convoy.json"));
    }

    #[test]
    fn env_overlays_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (PROVISIONER_ENV, "csi"),
            (CONFIG_MAP_ENV, "px-token"),
            (KUBECONFIGS_ENV, "/kube/source, /kube/destination,"),
        ]);
        let mut config = OrchestratorConfig {
            provisioner: "pxd".to_string(),
            instance_id: "run-1".to_string(),
            ..Default::default()
        };

        config.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.provisioner, "csi");
        assert_eq!(config.instance_id, "run-1");
        assert_eq!(config.config_map.as_deref(), Some("px-token"));
        assert_eq!(config.clusters.len(), 2);
        assert_eq!(config.clusters[0].name, "source");
        assert_eq!(config.clusters[1].id, 1);
        assert_eq!(config.clusters[1].config_path, "/kube/destination");
        assert!(config.clusters[1].hyper_converged);
    }

    #[test]
    fn kubeconfigs_do_not_replace_declared_clusters() {
        let mut config = OrchestratorConfig {
            clusters: vec![ClusterEntry {
                name: "declared".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        config.apply_env(|key| (key == KUBECONFIGS_ENV).then(|| "/kube/other".to_string()));

        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "declared");
    }

    #[test]
    fn kubeconfigs_sharing_a_file_name_get_distinct_names() {
        let clusters = clusters_from_kubeconfigs(
            "/clusters/source/config,/clusters/dest/config,/clusters/dr.yaml,/config",
        );

        let names: Vec<_> = clusters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["source-0", "dest-1", "dr.yaml", "cluster-3"]);
        assert_eq!(clusters[1].config_path, "/clusters/dest/config");
    }
}
