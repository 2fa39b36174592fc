//! Scheduling application templates into namespaces
//!
//! Each scheduling clones the shared templates, rewrites every name with the
//! suffix `-<cluster id>-<app-key index>` and submits the whole set as one
//! scheduler call. The index comes from the owning controller and is never
//! reused, so repeated schedules of an app-key never collide.

use std::collections::BTreeMap;

use convoy_common::{Error, Result, ResultExt, MAX_NAMESPACE_LEN};
use tracing::info;

use crate::controller::ClusterController;
use crate::driver::{Node, ResourceHandle, ScheduleOptions};
use crate::spec::AppSpec;

/// What to schedule, independent of where
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleApplicationsConfig {
    /// App-keys to schedule together
    pub app_keys: Vec<String>,
    /// Storage provisioner for the applications' volumes
    pub storage_provisioner: String,
    /// Identity attached to the scheduled applications
    pub instance_id: String,
    /// Candidate nodes
    pub nodes: Vec<Node>,
    /// Node labels to place by
    pub labels: BTreeMap<String, String>,
    /// Cluster the nodes and labels were taken from; `None` runs anywhere
    pub cluster: Option<String>,
}

impl ScheduleApplicationsConfig {
    /// Request for the given app-keys
    pub fn new(app_keys: Vec<String>) -> Self {
        Self {
            app_keys,
            ..Default::default()
        }
    }

    /// Set the storage provisioner
    pub fn storage_provisioner(mut self, provisioner: impl Into<String>) -> Self {
        self.storage_provisioner = provisioner.into();
        self
    }

    /// Set the instance id
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the candidate nodes
    pub fn nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Set the placement labels
    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Only run on the cluster named `cluster`
    pub fn for_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Schedule the applications into `namespace` of the controller's cluster
    ///
    /// Returns the handles the scheduler created; they are also tracked under
    /// the namespace by the controller. A request built by
    /// [`ClusterController::application`] carries that cluster's nodes and
    /// labels and is rejected on any other controller.
    pub async fn schedule_on_namespace(
        &self,
        controller: &ClusterController,
        namespace: &str,
    ) -> Result<Vec<ResourceHandle>> {
        if let Some(built_for) = self.cluster.as_deref().filter(|c| *c != controller.name()) {
            return Err(Error::ClusterMismatch {
                built_for: built_for.to_string(),
                cluster: controller.name().to_string(),
            })
            .traced();
        }
        if namespace.len() > MAX_NAMESPACE_LEN {
            return Err(Error::NamespaceTooLong {
                namespace: namespace.to_string(),
                limit: MAX_NAMESPACE_LEN,
            })
            .traced();
        }
        if self.app_keys.is_empty() {
            return Err(Error::EmptyAppKeys).traced();
        }

        let active = controller.switch_context().await?;

        let templates = self
            .app_keys
            .iter()
            .map(|app_key| {
                active
                    .spec_factory()
                    .get(app_key)
                    .map_err(|e| Error::MissingAppSpec {
                        app_key: app_key.clone(),
                        app_keys: self.app_keys.clone(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()
            .traced()?;

        let specs: Vec<AppSpec> = templates
            .iter()
            .map(|template| {
                let index = controller.next_app_key_index(&template.key);
                let mut spec = AppSpec::clone(template);
                spec.apply_suffix(&format!("-{}-{}", controller.id(), index));
                spec
            })
            .collect();
        let keys: Vec<String> = specs.iter().map(|spec| spec.key.clone()).collect();

        let options = ScheduleOptions {
            app_keys: self.app_keys.clone(),
            namespace: namespace.to_string(),
            storage_provisioner: self.storage_provisioner.clone(),
            nodes: self.nodes.clone(),
            labels: self.labels.clone(),
        };
        let handles = active
            .scheduler()
            .schedule_with_custom_specs(specs, &self.instance_id, &options)
            .await
            .traced_with(|| format!("namespace [{}] app-keys {:?}", namespace, keys))?;
        drop(active);

        controller.record_handles(namespace, &handles);
        info!(
            cluster = %controller.name(),
            namespace,
            app_keys = ?keys,
            handles = handles.len(),
            "Scheduled applications"
        );
        Ok(handles)
    }

    /// Schedule into `<prefix>-<cluster id>-<i>` for `i` in `0..count`
    ///
    /// Stops at the first failure, returning the namespaces already scheduled
    /// inside [`Error::PartialSchedule`]. They are left in place.
    pub async fn schedule_on_prefixed_namespaces(
        &self,
        controller: &ClusterController,
        prefix: &str,
        count: usize,
    ) -> Result<Vec<String>> {
        let mut scheduled = Vec::with_capacity(count);
        for i in 0..count {
            let namespace = format!("{}-{}-{}", prefix, controller.id(), i);
            if let Err(source) = self.schedule_on_namespace(controller, &namespace).await {
                return Err(Error::PartialSchedule {
                    scheduled,
                    source: Box::new(source),
                });
            }
            scheduled.push(namespace);
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockScheduler, MockVolumeDriver};
    use crate::spec::tests::postgres_spec;
    use crate::spec::SpecCatalog;
    use crate::testing::{allow_switching, controller, session_full, ssh_node_driver};
    use convoy_common::OrchestratorConfig;

    fn catalog() -> SpecCatalog {
        let mut catalog = SpecCatalog::new();
        catalog.insert(postgres_spec());
        catalog
    }

    /// Scheduler that echoes one handle per submitted spec
    fn echo_scheduler() -> MockScheduler {
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_schedule_with_custom_specs()
            .returning(|specs, _, options| {
                Ok(specs
                    .iter()
                    .map(|spec| ResourceHandle {
                        uid: format!("uid-{}", spec.key),
                        app_key: spec.key.clone(),
                        namespace: options.namespace.clone(),
                        skip_volume_validation: false,
                        refresh_storage_endpoint: false,
                    })
                    .collect())
            });
        scheduler
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            provisioner: "pxd".to_string(),
            instance_id: "run-1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn suffixes_are_per_cluster_and_never_repeat() {
        let mut scheduler = echo_scheduler();
        let mut volume = MockVolumeDriver::new();
        allow_switching(&mut scheduler, &mut volume);
        let session = session_full(scheduler, volume, ssh_node_driver(), catalog(), config());
        let three = controller(3, session.clone()).await;
        let seven = controller(7, session).await;

        let first = three
            .application("postgres")
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap();
        let second = three
            .application("postgres")
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap();
        let other = seven
            .application("postgres")
            .schedule_on_namespace(&seven, "ns-b")
            .await
            .unwrap();

        assert_eq!(first[0].app_key, "postgres-3-0");
        assert_eq!(second[0].app_key, "postgres-3-1");
        assert_eq!(other[0].app_key, "postgres-7-0");
        assert_eq!(three.get_app_key_count("postgres"), 2);
        assert_eq!(seven.get_app_key_count("postgres"), 1);
    }

    #[tokio::test]
    async fn scheduler_receives_rewritten_copies_and_options() {
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_schedule_with_custom_specs()
            .withf(|specs, instance_id, options| {
                instance_id == "run-1"
                    && options.namespace == "ns-a"
                    && options.storage_provisioner == "pxd"
                    && options.app_keys == vec!["postgres".to_string()]
                    && specs.len() == 1
                    && specs[0].key == "postgres-3-0"
            })
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        let mut volume = MockVolumeDriver::new();
        allow_switching(&mut scheduler, &mut volume);
        let session = session_full(scheduler, volume, ssh_node_driver(), catalog(), config());
        let three = controller(3, session).await;

        let handles = three
            .application("postgres")
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap();

        assert!(handles.is_empty());
        assert!(three.is_namespace_tracked("ns-a"));
    }

    #[tokio::test]
    async fn tracked_handles_grow_by_what_was_scheduled() {
        let mut scheduler = echo_scheduler();
        let mut volume = MockVolumeDriver::new();
        allow_switching(&mut scheduler, &mut volume);
        let mut catalog = catalog();
        let mut redis = postgres_spec();
        redis.key = "redis".to_string();
        catalog.insert(redis);
        let session = session_full(scheduler, volume, ssh_node_driver(), catalog, config());
        let three = controller(3, session).await;

        three
            .application("postgres")
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap();
        let handles = three
            .multiple_applications(vec!["postgres".to_string(), "redis".to_string()])
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap();

        assert_eq!(handles.len(), 2);
        let tracked: Vec<_> = three
            .get_namespace_info("ns-a")
            .handles
            .into_iter()
            .map(|h| h.app_key)
            .collect();
        assert_eq!(tracked, vec!["postgres-3-0", "postgres-3-1", "redis-3-0"]);
    }

    #[tokio::test]
    async fn prefixed_namespaces_are_tracked_separately() {
        let mut scheduler = echo_scheduler();
        let mut volume = MockVolumeDriver::new();
        allow_switching(&mut scheduler, &mut volume);
        let session = session_full(scheduler, volume, ssh_node_driver(), catalog(), config());
        let one = controller(1, session).await;

        let namespaces = one
            .application("postgres")
            .schedule_on_prefixed_namespaces(&one, "batch", 3)
            .await
            .unwrap();

        assert_eq!(namespaces, vec!["batch-1-0", "batch-1-1", "batch-1-2"]);
        for namespace in &namespaces {
            let info = one.get_namespace_info(namespace);
            assert_eq!(info.handles.len(), 1);
            assert_eq!(&info.handles[0].namespace, namespace);
        }
    }

    #[tokio::test]
    async fn prefixed_scheduling_returns_partial_progress() {
        let mut scheduler = MockScheduler::new();
        let mut calls = 0;
        scheduler
            .expect_schedule_with_custom_specs()
            .returning(move |_, _, _| {
                calls += 1;
                if calls == 2 {
                    Err(Error::driver("schedule", "quota exceeded"))
                } else {
                    Ok(Vec::new())
                }
            });
        let mut volume = MockVolumeDriver::new();
        allow_switching(&mut scheduler, &mut volume);
        let session = session_full(scheduler, volume, ssh_node_driver(), catalog(), config());
        let one = controller(1, session).await;

        let err = one
            .application("postgres")
            .schedule_on_prefixed_namespaces(&one, "batch", 3)
            .await
            .unwrap_err();

        match err {
            Error::PartialSchedule { scheduled, source } => {
                assert_eq!(scheduled, vec!["batch-1-0"]);
                assert!(source.to_string().contains("quota exceeded"));
            }
            other => panic!("expected a partial schedule, got {other}"),
        }
        assert!(!one.is_namespace_tracked("batch-1-1"));
    }

    #[tokio::test]
    async fn too_long_namespace_is_rejected_before_any_call() {
        let session = session_full(
            MockScheduler::new(),
            MockVolumeDriver::new(),
            ssh_node_driver(),
            catalog(),
            config(),
        );
        let three = controller(3, session).await;
        let namespace = "n".repeat(MAX_NAMESPACE_LEN + 1);

        let err = three
            .application("postgres")
            .schedule_on_namespace(&three, &namespace)
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(matches!(err.root(), Error::NamespaceTooLong { limit: 63, .. }));
        assert_eq!(three.get_app_key_count("postgres"), 0);
        assert!(three.namespaces().is_empty());
    }

    #[tokio::test]
    async fn missing_app_key_names_every_key_and_consumes_no_index() {
        let mut scheduler = MockScheduler::new();
        let mut volume = MockVolumeDriver::new();
        allow_switching(&mut scheduler, &mut volume);
        scheduler.expect_schedule_with_custom_specs().never();
        let session = session_full(scheduler, volume, ssh_node_driver(), catalog(), config());
        let three = controller(3, session).await;

        let err = three
            .multiple_applications(vec!["postgres".to_string(), "mysql".to_string()])
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap_err();

        match err.root() {
            Error::MissingAppSpec {
                app_key, app_keys, ..
            } => {
                assert_eq!(app_key, "mysql");
                assert_eq!(app_keys, &vec!["postgres".to_string(), "mysql".to_string()]);
            }
            other => panic!("expected a missing spec, got {other}"),
        }
        assert_eq!(three.get_app_key_count("postgres"), 0);
    }

    #[tokio::test]
    async fn empty_app_keys_are_rejected() {
        let session = session_full(
            MockScheduler::new(),
            MockVolumeDriver::new(),
            ssh_node_driver(),
            catalog(),
            config(),
        );
        let three = controller(3, session).await;

        let err = three
            .multiple_applications(Vec::new())
            .schedule_on_namespace(&three, "ns-a")
            .await
            .unwrap_err();

        assert!(matches!(err.root(), Error::EmptyAppKeys));
    }

    #[tokio::test]
    async fn request_from_another_cluster_is_rejected_before_any_call() {
        let session = session_full(
            MockScheduler::new(),
            MockVolumeDriver::new(),
            ssh_node_driver(),
            catalog(),
            config(),
        );
        let three = controller(3, session.clone()).await;
        let seven = controller(7, session).await;

        let err = three
            .application("postgres")
            .schedule_on_namespace(&seven, "ns-a")
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(
            err.root().to_string(),
            "schedule request built for cluster [cluster-3] cannot run on cluster [cluster-7]"
        );
        assert_eq!(seven.get_app_key_count("postgres"), 0);
        assert_eq!(seven.session().active_path().await, "");
    }
}
