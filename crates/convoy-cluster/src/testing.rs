//! Test fixtures shared by the unit tests

use std::sync::Arc;

use convoy_common::OrchestratorConfig;

use crate::controller::ClusterController;
use crate::descriptor::ClusterDescriptor;
use crate::driver::{
    Drivers, MockNodeDriver, MockScheduler, MockVolumeDriver, ResourceHandle,
};
use crate::session::ClusterSession;
use crate::spec::SpecCatalog;

/// Session over the given mocks with an empty catalog and default config
pub(crate) fn session_with(
    scheduler: MockScheduler,
    volume: MockVolumeDriver,
    node: MockNodeDriver,
) -> Arc<ClusterSession> {
    session_full(
        scheduler,
        volume,
        node,
        SpecCatalog::new(),
        OrchestratorConfig::default(),
    )
}

pub(crate) fn session_full(
    scheduler: MockScheduler,
    volume: MockVolumeDriver,
    node: MockNodeDriver,
    catalog: SpecCatalog,
    config: OrchestratorConfig,
) -> Arc<ClusterSession> {
    let drivers = Drivers::new(
        Arc::new(scheduler),
        Arc::new(volume),
        Arc::new(node),
        Arc::new(catalog),
    );
    Arc::new(ClusterSession::new(drivers, config))
}

/// SSH node driver that always refreshes
pub(crate) fn ssh_node_driver() -> MockNodeDriver {
    let mut node = MockNodeDriver::new();
    node.expect_is_ssh().return_const(true);
    node.expect_name().return_const("ssh".to_string());
    node.expect_refresh().returning(|| Ok(()));
    node
}

/// Let every context switch succeed
pub(crate) fn allow_switching(scheduler: &mut MockScheduler, volume: &mut MockVolumeDriver) {
    scheduler.expect_set_config().returning(|_| Ok(()));
    scheduler.expect_refresh_node_registry().returning(|| Ok(()));
    volume.expect_refresh_driver_endpoints().returning(|| Ok(()));
}

/// Hyper-converged controller named `cluster-<id>` at `/kube/<id>`
pub(crate) async fn controller(id: u32, session: Arc<ClusterSession>) -> ClusterController {
    ClusterDescriptor::new(id, format!("cluster-{id}"), format!("/kube/{id}"))
        .controller(session)
        .await
        .unwrap()
}

pub(crate) fn handle(uid: &str, app_key: &str, namespace: &str) -> ResourceHandle {
    ResourceHandle {
        uid: uid.to_string(),
        app_key: app_key.to_string(),
        namespace: namespace.to_string(),
        skip_volume_validation: false,
        refresh_storage_endpoint: false,
    }
}
