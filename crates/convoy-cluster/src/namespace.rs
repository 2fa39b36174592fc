//! Validating and destroying what was scheduled into a namespace

use std::time::Duration;

use convoy_common::{
    Error, OrchestratorConfig, Result, ResultExt, AUTH_TOKEN_PARAM, REFRESH_ENDPOINT_PARAM,
};
use tracing::{debug, info};

use crate::controller::ClusterController;
use crate::driver::{DestroyOptions, ResourceHandle, VolumeOptions};
use crate::session::ActiveCluster;
use crate::stats::{ExecutionRecord, Operation};

/// Validate or destroy request for one namespace
///
/// Built from [`ClusterController::select_namespace`] with the configured
/// defaults, then narrowed with the builder methods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceConfig {
    namespace: String,
    app_key: Option<String>,
    skip_precondition_check: bool,
    destroy_options: DestroyOptions,
    wait_for_running_timeout: Duration,
    wait_for_running_retry_interval: Duration,
    validate_volume_timeout: Duration,
    validate_volume_retry_interval: Duration,
}

impl NamespaceConfig {
    /// Request for `namespace` with the configured defaults
    pub fn new(namespace: impl Into<String>, config: &OrchestratorConfig) -> Self {
        Self {
            namespace: namespace.into(),
            app_key: None,
            skip_precondition_check: false,
            destroy_options: DestroyOptions {
                wait_for_destroy: config.destroy.wait_for_destroy,
                wait_for_resource_leak_cleanup: config.destroy.wait_for_resource_leak_cleanup,
                skip_cluster_scoped_objects: config.destroy.skip_cluster_scoped_objects,
            },
            wait_for_running_timeout: config.timeouts.wait_for_running_timeout(),
            wait_for_running_retry_interval: config.timeouts.wait_for_running_retry_interval(),
            validate_volume_timeout: config.timeouts.validate_volume_timeout(),
            validate_volume_retry_interval: config.timeouts.validate_volume_retry_interval(),
        }
    }

    /// Selected namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Options passed to the scheduler on destroy
    pub fn destroy_options(&self) -> DestroyOptions {
        self.destroy_options
    }

    /// Only act on handles scheduled from `app_key`
    pub fn application(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = Some(app_key.into());
        self
    }

    /// Succeed without any call when nothing matches
    pub fn skip_precondition_check(mut self) -> Self {
        self.skip_precondition_check = true;
        self
    }

    /// Wait until the resources are gone on destroy
    pub fn wait_for_destroy(mut self, wait: bool) -> Self {
        self.destroy_options.wait_for_destroy = wait;
        self
    }

    /// Wait for resource-leak cleanup on destroy
    pub fn wait_for_resource_leak_cleanup(mut self, wait: bool) -> Self {
        self.destroy_options.wait_for_resource_leak_cleanup = wait;
        self
    }

    /// Leave cluster-scoped objects in place on destroy
    pub fn skip_cluster_scoped_objects(mut self, skip: bool) -> Self {
        self.destroy_options.skip_cluster_scoped_objects = skip;
        self
    }

    /// Bound the wait for the running state
    pub fn wait_for_running(mut self, timeout: Duration, retry_interval: Duration) -> Self {
        self.wait_for_running_timeout = timeout;
        self.wait_for_running_retry_interval = retry_interval;
        self
    }

    /// Bound volume validation
    pub fn validate_volume(mut self, timeout: Duration, retry_interval: Duration) -> Self {
        self.validate_volume_timeout = timeout;
        self.validate_volume_retry_interval = retry_interval;
        self
    }

    fn matches(&self, handle: &ResourceHandle) -> bool {
        match &self.app_key {
            Some(app_key) => handle.app_key.starts_with(&format!("{}-", app_key)),
            None => true,
        }
    }

    /// Tracked handles this request applies to, checked against the precondition
    fn selected_handles(&self, controller: &ClusterController) -> Result<Vec<ResourceHandle>> {
        let tracked = controller.is_namespace_tracked(&self.namespace);
        let handles: Vec<_> = controller
            .get_namespace_info(&self.namespace)
            .handles
            .into_iter()
            .filter(|handle| self.matches(handle))
            .collect();

        if !self.skip_precondition_check {
            if !tracked {
                return Err(Error::NamespaceNotTracked {
                    cluster: controller.name().to_string(),
                    namespace: self.namespace.clone(),
                });
            }
            if handles.is_empty() {
                return Err(Error::NoResources {
                    cluster: controller.name().to_string(),
                    namespace: self.namespace.clone(),
                    app_key: self.app_key.clone(),
                });
            }
        }
        Ok(handles)
    }

    /// Check every selected application is running with healthy volumes
    ///
    /// Stops at the first failing handle. Every handle attempted gets an
    /// execution record.
    pub async fn validate(&self, controller: &ClusterController) -> Result<()> {
        let handles = self.selected_handles(controller).traced()?;
        if handles.is_empty() {
            debug!(namespace = %self.namespace, "Nothing to validate");
            return Ok(());
        }

        let active = controller.switch_context().await?;
        for handle in &handles {
            let record = ExecutionRecord::start(Operation::Validate, &self.namespace)
                .with_resource("app-key", &handle.app_key)
                .with_resource("uid", &handle.uid);
            let result = self.validate_handle(&active, handle).await;
            controller.record_execution(record.finish(result.is_ok()));
            result.traced_with(|| handle.to_string())?;
            info!(cluster = %controller.name(), handle = %handle, "Validated application");
        }
        Ok(())
    }

    async fn validate_handle(&self, active: &ActiveCluster<'_>, handle: &ResourceHandle) -> Result<()> {
        let scheduler = active.scheduler();
        scheduler
            .wait_for_running(
                handle,
                self.wait_for_running_timeout,
                self.wait_for_running_retry_interval,
            )
            .await
            .traced()?;

        if !active.config().topology_labels.is_empty() {
            scheduler.validate_topology_label(handle).await.traced()?;
        }

        if handle.skip_volume_validation {
            debug!(handle = %handle, "Skipping volume validation");
            return Ok(());
        }

        scheduler
            .validate_volumes(
                handle,
                self.validate_volume_timeout,
                self.validate_volume_retry_interval,
            )
            .await
            .traced()?;

        let parameters = scheduler.get_volume_parameters(handle).await.traced()?;
        let token = match &active.config().config_map {
            Some(config_map) if !parameters.is_empty() => Some(
                scheduler
                    .get_token_from_config_map(config_map)
                    .await
                    .traced_with(|| format!("config map [{}]", config_map))?,
            ),
            _ => None,
        };
        for (volume, mut params) in parameters {
            if let Some(token) = &token {
                params.insert(AUTH_TOKEN_PARAM.to_string(), token.clone());
            }
            if handle.refresh_storage_endpoint {
                params.insert(REFRESH_ENDPOINT_PARAM.to_string(), "true".to_string());
            }
            active
                .volume_driver()
                .validate_create_volume(&volume, &params)
                .await
                .traced_with(|| format!("volume [{}]", volume))?;
        }

        for volume in scheduler.get_volumes(handle).await.traced()? {
            active
                .volume_driver()
                .validate_volume_setup(&volume)
                .await
                .traced_with(|| format!("volume [{}]", volume))?;
        }
        Ok(())
    }

    /// Destroy every selected application and its volumes
    ///
    /// The handles leave the namespace's live list only when all of them were
    /// destroyed; after a failure part way the list is left as it was. The
    /// namespace itself stays tracked.
    pub async fn destroy(&self, controller: &ClusterController) -> Result<()> {
        let handles = self.selected_handles(controller).traced()?;
        if handles.is_empty() {
            debug!(namespace = %self.namespace, "Nothing to destroy");
            return Ok(());
        }

        let active = controller.switch_context().await?;
        for handle in &handles {
            let record = ExecutionRecord::start(Operation::Destroy, &self.namespace)
                .with_resource("app-key", &handle.app_key)
                .with_resource("uid", &handle.uid);
            let result = self.destroy_handle(&active, handle).await;
            controller.record_execution(record.finish(result.is_ok()));
            result.traced_with(|| handle.to_string())?;
            info!(cluster = %controller.name(), handle = %handle, "Destroyed application");
        }
        drop(active);

        let uids: Vec<String> = handles.into_iter().map(|handle| handle.uid).collect();
        controller.forget_handles(&self.namespace, &uids);
        Ok(())
    }

    /// Namespace-scoped volumes go first, cluster-scoped ones after the
    /// application is gone.
    async fn destroy_handle(&self, active: &ActiveCluster<'_>, handle: &ResourceHandle) -> Result<()> {
        let scheduler = active.scheduler();
        let deleted = scheduler
            .delete_volumes(
                handle,
                &VolumeOptions {
                    skip_cluster_scoped_objects: true,
                },
            )
            .await
            .traced()?;

        scheduler
            .destroy(handle, &self.destroy_options)
            .await
            .traced()?;

        if !handle.skip_volume_validation {
            for volume in &deleted {
                active
                    .volume_driver()
                    .validate_delete_volume(volume)
                    .await
                    .traced_with(|| format!("volume [{}]", volume))?;
            }
        }

        if !self.destroy_options.skip_cluster_scoped_objects {
            scheduler
                .delete_volumes(
                    handle,
                    &VolumeOptions {
                        skip_cluster_scoped_objects: false,
                    },
                )
                .await
                .traced()?;
        }
        Ok(())
    }
}
