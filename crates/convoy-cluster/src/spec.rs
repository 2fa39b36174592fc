//! Application templates and collision-free renaming
//!
//! An [`AppSpec`] is the set of Kubernetes objects an app-key expands to.
//! Before scheduling, each template is cloned and every name-bearing field is
//! suffixed so repeated schedules of the same app-key never collide. The set
//! of rewritten fields is spelled out per kind in [`SpecObject::apply_suffix`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use convoy_common::{Error, OrchestratorConfig, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, Pod, PodSpec, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Resource;
use kube::api::DynamicObject;
use serde::Deserialize;
use tracing::debug;

use crate::driver::SpecFactory;

/// Objects whose name is a field of their metadata
pub trait Nameable {
    /// Current name, if set
    fn name(&self) -> Option<&str>;

    /// Replace the name
    fn set_name(&mut self, name: String);
}

macro_rules! spec_objects {
    ($($(#[$doc:meta])* $variant:ident($ty:ty)),+ $(,)?) => {
        /// One Kubernetes object of an application template
        ///
        /// Known kinds are typed so their cross-references can be rewritten.
        /// Anything else is carried as [`SpecObject::Custom`]: it is cloned and
        /// renamed like the rest, but its internal references are left alone.
        #[derive(Clone, Debug)]
        pub enum SpecObject {
            $($(#[$doc])* $variant($ty),)+
            /// Any other kind, kept untyped
            Custom(DynamicObject),
        }

        impl SpecObject {
            /// Kubernetes kind of the object
            pub fn kind(&self) -> &str {
                match self {
                    $(SpecObject::$variant(_) => <$ty as k8s_openapi::Resource>::KIND,)+
                    SpecObject::Custom(o) => o
                        .types
                        .as_ref()
                        .map(|types| types.kind.as_str())
                        .unwrap_or("Unknown"),
                }
            }

            fn metadata(&self) -> &ObjectMeta {
                match self {
                    $(SpecObject::$variant(o) => &o.metadata,)+
                    SpecObject::Custom(o) => &o.metadata,
                }
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(SpecObject::$variant(o) => &mut o.metadata,)+
                    SpecObject::Custom(o) => &mut o.metadata,
                }
            }

            fn from_yaml(kind: &str, value: serde_yaml::Value) -> std::result::Result<Self, serde_yaml::Error> {
                $(
                    if kind == <$ty as k8s_openapi::Resource>::KIND {
                        return serde_yaml::from_value(value).map(SpecObject::$variant);
                    }
                )+
                serde_yaml::from_value(value).map(SpecObject::Custom)
            }
        }

        $(
            impl From<$ty> for SpecObject {
                fn from(object: $ty) -> Self {
                    SpecObject::$variant(object)
                }
            }
        )+
    };
}

spec_objects! {
    /// apps/v1 Deployment
    Deployment(Deployment),
    /// apps/v1 StatefulSet
    StatefulSet(StatefulSet),
    /// apps/v1 DaemonSet
    DaemonSet(DaemonSet),
    /// batch/v1 Job
    Job(Job),
    /// v1 Pod
    Pod(Pod),
    /// v1 Service
    Service(Service),
    /// v1 PersistentVolumeClaim
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// storage.k8s.io/v1 StorageClass
    StorageClass(StorageClass),
    /// v1 Secret
    Secret(Secret),
    /// v1 ConfigMap
    ConfigMap(ConfigMap),
    /// v1 ServiceAccount
    ServiceAccount(ServiceAccount),
    /// rbac.authorization.k8s.io/v1 Role
    Role(Role),
    /// rbac.authorization.k8s.io/v1 RoleBinding
    RoleBinding(RoleBinding),
    /// rbac.authorization.k8s.io/v1 ClusterRole
    ClusterRole(ClusterRole),
    /// rbac.authorization.k8s.io/v1 ClusterRoleBinding
    ClusterRoleBinding(ClusterRoleBinding),
}

impl From<DynamicObject> for SpecObject {
    fn from(object: DynamicObject) -> Self {
        SpecObject::Custom(object)
    }
}

impl Nameable for SpecObject {
    fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref()
    }

    fn set_name(&mut self, name: String) {
        self.metadata_mut().name = Some(name);
    }
}

impl SpecObject {
    /// Append `suffix` to the object's name and to every name it references
    ///
    /// Rewritten references:
    /// - workload pod templates (and bare pods): persistent volume claim names
    /// - stateful set claim templates: storage class names
    /// - persistent volume claims: storage class names
    ///
    /// References to secrets, config maps, service accounts and roles are only
    /// rewritten by [`AppSpec::apply_suffix`], which knows which of them the
    /// application defines itself.
    pub fn apply_suffix(&mut self, suffix: &str) {
        if let Some(name) = self.name().map(|name| format!("{name}{suffix}")) {
            self.set_name(name);
        }

        if let Some(spec) = self.pod_spec_mut() {
            for volume in spec.volumes.iter_mut().flatten() {
                if let Some(claim) = volume.persistent_volume_claim.as_mut() {
                    claim.claim_name.push_str(suffix);
                }
            }
        }
        match self {
            SpecObject::StatefulSet(o) => {
                let templates = o.spec.as_mut().and_then(|s| s.volume_claim_templates.as_mut());
                for claim in templates.into_iter().flatten() {
                    suffix_storage_class(claim, suffix);
                }
            }
            SpecObject::PersistentVolumeClaim(o) => suffix_storage_class(o, suffix),
            _ => {}
        }
    }

    fn pod_spec_mut(&mut self) -> Option<&mut PodSpec> {
        match self {
            SpecObject::Deployment(o) => o.spec.as_mut()?.template.spec.as_mut(),
            SpecObject::DaemonSet(o) => o.spec.as_mut()?.template.spec.as_mut(),
            SpecObject::Job(o) => o.spec.as_mut()?.template.spec.as_mut(),
            SpecObject::StatefulSet(o) => o.spec.as_mut()?.template.spec.as_mut(),
            SpecObject::Pod(o) => o.spec.as_mut(),
            _ => None,
        }
    }

    fn suffix_local_references(&mut self, local: &LocalNames<'_>) {
        if let Some(spec) = self.pod_spec_mut() {
            suffix_pod_references(spec, local);
        }
        let (role_ref, subjects) = match self {
            SpecObject::RoleBinding(o) => (&mut o.role_ref, o.subjects.as_mut()),
            SpecObject::ClusterRoleBinding(o) => (&mut o.role_ref, o.subjects.as_mut()),
            _ => return,
        };
        local.rewrite(&role_ref.kind, &mut role_ref.name);
        for subject in subjects.into_iter().flatten() {
            local.rewrite(&subject.kind, &mut subject.name);
        }
    }
}

/// Kind and name of every object an application defines, taken before renaming
struct LocalNames<'a> {
    names: BTreeSet<(String, String)>,
    suffix: &'a str,
}

impl<'a> LocalNames<'a> {
    fn collect(specs: &[SpecObject], suffix: &'a str) -> Self {
        let names = specs
            .iter()
            .filter_map(|spec| Some((spec.kind().to_string(), spec.name()?.to_string())))
            .collect();
        Self { names, suffix }
    }

    /// Suffix `name` when it refers to an object of the application
    fn rewrite(&self, kind: &str, name: &mut String) {
        if self.names.contains(&(kind.to_string(), name.clone())) {
            name.push_str(self.suffix);
        }
    }
}

fn suffix_pod_references(spec: &mut PodSpec, local: &LocalNames<'_>) {
    let accounts = spec
        .service_account_name
        .iter_mut()
        .chain(spec.service_account.iter_mut());
    for account in accounts {
        local.rewrite(ServiceAccount::KIND, account);
    }

    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(name) = volume.secret.as_mut().and_then(|s| s.secret_name.as_mut()) {
            local.rewrite(Secret::KIND, name);
        }
        if let Some(source) = volume.config_map.as_mut() {
            local.rewrite(ConfigMap::KIND, &mut source.name);
        }
    }

    let containers = spec
        .containers
        .iter_mut()
        .chain(spec.init_containers.iter_mut().flatten());
    for container in containers {
        for source in container.env_from.iter_mut().flatten() {
            if let Some(config_map) = source.config_map_ref.as_mut() {
                local.rewrite(ConfigMap::KIND, &mut config_map.name);
            }
            if let Some(secret) = source.secret_ref.as_mut() {
                local.rewrite(Secret::KIND, &mut secret.name);
            }
        }
        let value_sources = container
            .env
            .iter_mut()
            .flatten()
            .filter_map(|var| var.value_from.as_mut());
        for source in value_sources {
            if let Some(key) = source.config_map_key_ref.as_mut() {
                local.rewrite(ConfigMap::KIND, &mut key.name);
            }
            if let Some(key) = source.secret_key_ref.as_mut() {
                local.rewrite(Secret::KIND, &mut key.name);
            }
        }
    }
}

fn suffix_storage_class(claim: &mut PersistentVolumeClaim, suffix: &str) {
    if let Some(class) = claim
        .spec
        .as_mut()
        .and_then(|spec| spec.storage_class_name.as_mut())
    {
        class.push_str(suffix);
    }
}

/// The objects an app-key expands to
#[derive(Clone, Debug)]
pub struct AppSpec {
    /// App-key, rewritten with the naming suffix once scheduled
    pub key: String,
    /// Disabled templates are kept in the catalog but not scheduled by default
    pub enabled: bool,
    /// Objects of the application
    pub specs: Vec<SpecObject>,
}

impl AppSpec {
    /// Create an enabled application template
    pub fn new(key: impl Into<String>, specs: Vec<SpecObject>) -> Self {
        Self {
            key: key.into(),
            enabled: true,
            specs,
        }
    }

    /// Append `suffix` to the key and to every object of the application
    ///
    /// Secret, config map, service account and role references are suffixed
    /// when the application defines the referenced object; references to
    /// objects it does not define are left pointing at the original name.
    pub fn apply_suffix(&mut self, suffix: &str) {
        let local = LocalNames::collect(&self.specs, suffix);
        self.key.push_str(suffix);
        for spec in &mut self.specs {
            spec.apply_suffix(suffix);
            spec.suffix_local_references(&local);
        }
    }
}

/// Parse multi-document YAML into spec objects, skipping empty documents
pub fn parse_manifests(yaml: &str) -> std::result::Result<Vec<SpecObject>, serde_yaml::Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|kind| kind.as_str())
            .unwrap_or_default()
            .to_string();
        objects.push(SpecObject::from_yaml(&kind, value)?);
    }
    Ok(objects)
}

/// In-memory application templates keyed by app-key
///
/// Templates are shared; [`SpecFactory::get`] hands out the shared copy and
/// callers clone it before rewriting.
#[derive(Clone, Debug, Default)]
pub struct SpecCatalog {
    specs: BTreeMap<String, Arc<AppSpec>>,
}

impl SpecCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under its key, replacing any previous one
    pub fn insert(&mut self, spec: AppSpec) {
        self.specs.insert(spec.key.clone(), Arc::new(spec));
    }

    /// Registered app-keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Number of registered templates
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Load every `<dir>/<app-key>/*.yaml` (or `.yml`) file
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut catalog = Self::new();
        for app_dir in sorted_entries(dir)? {
            if !app_dir.is_dir() {
                continue;
            }
            let Some(key) = app_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
            else {
                continue;
            };

            let mut specs = Vec::new();
            for file in sorted_entries(&app_dir)? {
                if !is_yaml(&file) {
                    continue;
                }
                let content = std::fs::read_to_string(&file).map_err(|e| {
                    Error::config(format!("failed to read {}: {}", file.display(), e))
                })?;
                let objects = parse_manifests(&content).map_err(|e| {
                    Error::config(format!("failed to parse {}: {}", file.display(), e))
                })?;
                specs.extend(objects);
            }

            debug!(app_key = %key, objects = specs.len(), "Loaded application template");
            catalog.insert(AppSpec::new(key, specs));
        }
        Ok(catalog)
    }

    /// Load the configured spec directory, or start empty when none is set
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        match &config.spec_dir {
            Some(dir) => Self::load_dir(dir),
            None => Ok(Self::new()),
        }
    }
}

impl SpecFactory for SpecCatalog {
    fn get(&self, app_key: &str) -> Result<Arc<AppSpec>> {
        self.specs.get(app_key).cloned().ok_or_else(|| {
            Error::driver(
                "get-spec",
                format!("app-key [{}] is not in the spec catalog", app_key),
            )
        })
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::config(format!("failed to read {}: {}", dir.display(), e)))?;
    let mut paths = entries
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::config(format!("failed to list {}: {}", dir.display(), e)))?;
    paths.sort();
    Ok(paths)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}
