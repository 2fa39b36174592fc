//! The single active-cluster context shared by every controller
//!
//! The scheduler, volume driver and node driver are process-wide and talk to
//! one cluster at a time. [`ClusterSession`] owns them together with the path
//! of the cluster they currently point at, and hands out an [`ActiveCluster`]
//! guard on switch. Holding the guard keeps other controllers from switching
//! away until the caller's collaborator calls are done.

use std::sync::Arc;

use convoy_common::{Error, OrchestratorConfig, Result, SwitchStep, IN_CLUSTER_CONFIG_PATH};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::driver::{Drivers, NodeDriver, Scheduler, SpecFactory, VolumeDriver};

/// Owner of the collaborators and of the active cluster path
#[derive(Debug)]
pub struct ClusterSession {
    drivers: Drivers,
    config: OrchestratorConfig,
    active: Mutex<ActivePath>,
}

/// Recorded cluster path and whether the collaborators still match it
#[derive(Debug)]
struct ActivePath {
    path: String,
    /// Set when a switch failed after collaborators may have moved
    stale: bool,
}

impl ClusterSession {
    /// Create a session pointing at the cluster this process runs in
    pub fn new(drivers: Drivers, config: OrchestratorConfig) -> Self {
        Self {
            drivers,
            config,
            active: Mutex::new(ActivePath {
                path: IN_CLUSTER_CONFIG_PATH.to_string(),
                stale: false,
            }),
        }
    }

    /// Orchestrator configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Config path of the cluster the collaborators point at
    ///
    /// Waits for any in-flight switch or guarded call sequence to finish.
    pub async fn active_path(&self) -> String {
        self.active.lock().await.path.clone()
    }

    /// Point every collaborator at the cluster behind `config_path`
    ///
    /// Switching to the already active path performs no collaborator calls. A
    /// failure leaves the active path unchanged and names the failed step.
    /// After it, the next switch to any path re-runs every step.
    pub async fn switch_to(&self, config_path: &str) -> Result<ActiveCluster<'_>> {
        let mut active = self.active.lock().await;
        if active.path == config_path && !active.stale {
            debug!(config_path, "Cluster context already active");
        } else {
            info!(
                from = active.path.as_str(),
                to = config_path,
                stale = active.stale,
                "Switching cluster context"
            );
            if let Err(e) = self.refresh(config_path).await {
                warn!(
                    config_path,
                    recorded = active.path.as_str(),
                    "Cluster context switch failed, collaborators marked stale"
                );
                active.stale = true;
                return Err(e);
            }
            active.path = config_path.to_string();
            active.stale = false;
        }

        Ok(ActiveCluster {
            active,
            drivers: &self.drivers,
            config: &self.config,
        })
    }

    async fn refresh(&self, config_path: &str) -> Result<()> {
        let switch_error = |step: SwitchStep| {
            move |source: Error| Error::ContextSwitch {
                step,
                path: config_path.to_string(),
                source: Box::new(source),
            }
        };

        self.drivers
            .scheduler
            .set_config(config_path)
            .await
            .map_err(switch_error(SwitchStep::SetConfig))?;
        self.drivers
            .scheduler
            .refresh_node_registry()
            .await
            .map_err(switch_error(SwitchStep::RefreshNodeRegistry))?;
        self.drivers
            .volume
            .refresh_driver_endpoints()
            .await
            .map_err(switch_error(SwitchStep::RefreshDriverEndpoints))?;

        if !self.drivers.node.is_ssh() {
            return Err(Error::UnsupportedNodeDriver {
                driver: self.drivers.node.name(),
                path: config_path.to_string(),
            });
        }
        self.drivers
            .node
            .refresh()
            .await
            .map_err(switch_error(SwitchStep::RefreshNodeDriver))
    }
}

/// Exclusive access to the collaborators while they point at one cluster
pub struct ActiveCluster<'a> {
    active: MutexGuard<'a, ActivePath>,
    drivers: &'a Drivers,
    config: &'a OrchestratorConfig,
}

impl ActiveCluster<'_> {
    /// Config path of the active cluster
    pub fn config_path(&self) -> &str {
        &self.active.path
    }

    /// Workload scheduler
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.drivers.scheduler
    }

    /// Storage driver
    pub fn volume_driver(&self) -> &Arc<dyn VolumeDriver> {
        &self.drivers.volume
    }

    /// Node access driver
    pub fn node_driver(&self) -> &Arc<dyn NodeDriver> {
        &self.drivers.node
    }

    /// Application template source
    pub fn spec_factory(&self) -> &Arc<dyn SpecFactory> {
        &self.drivers.specs
    }

    /// Orchestrator configuration
    pub fn config(&self) -> &OrchestratorConfig {
        self.config
    }
}

impl std::fmt::Debug for ActiveCluster<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCluster")
            .field("config_path", &self.config_path())
            .finish_non_exhaustive()
    }
}
