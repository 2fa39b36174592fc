//! Error types for convoy orchestration
//!
//! Errors fall into four groups: configuration errors detected before any
//! collaborator call, precondition errors detected from bookkeeping lookups,
//! collaborator errors surfaced by the scheduler, volume or node drivers, and
//! partial-failure errors that carry whatever progress was made before the
//! failure. Any of them may be wrapped in [`Error::Traced`] to record the call
//! site and a debug payload as it propagates up.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Step of a cluster context switch that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchStep {
    /// Loading the kubeconfig into the scheduler
    SetConfig,
    /// Refreshing the scheduler's node registry
    RefreshNodeRegistry,
    /// Refreshing the volume driver's endpoints
    RefreshDriverEndpoints,
    /// Refreshing the SSH node driver
    RefreshNodeDriver,
}

impl fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            SwitchStep::SetConfig => "set-config",
            SwitchStep::RefreshNodeRegistry => "refresh-node-registry",
            SwitchStep::RefreshDriverEndpoints => "refresh-driver-endpoints",
            SwitchStep::RefreshNodeDriver => "refresh-node-driver",
        };
        f.write_str(step)
    }
}

/// Main error type for convoy operations
#[derive(Debug, Error)]
pub enum Error {
    /// Namespace name is longer than Kubernetes allows
    #[error("namespace [{namespace}] exceeds the maximum character limit of [{limit}]")]
    NamespaceTooLong {
        /// The rejected namespace
        namespace: String,
        /// The enforced limit
        limit: usize,
    },

    /// An app-key could not be resolved to a spec
    #[error("failed to get spec for app-key [{app_key}] of app-keys {app_keys:?}: {message}")]
    MissingAppSpec {
        /// The app-key that failed to resolve
        app_key: String,
        /// Every app-key of the request
        app_keys: Vec<String>,
        /// Reason reported by the spec factory
        message: String,
    },

    /// A schedule request named no applications
    #[error("the app list cannot be empty")]
    EmptyAppKeys,

    /// A request built from one cluster's nodes was run on another cluster
    #[error("schedule request built for cluster [{built_for}] cannot run on cluster [{cluster}]")]
    ClusterMismatch {
        /// Cluster whose nodes and labels filled the request
        built_for: String,
        /// Cluster the request was run on
        cluster: String,
    },

    /// Invalid or unreadable configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Namespace was never scheduled on the cluster
    #[error("namespace [{namespace}] is not in the records of cluster [{cluster}]")]
    NamespaceNotTracked {
        /// Name of the cluster
        cluster: String,
        /// The untracked namespace
        namespace: String,
    },

    /// Namespace is tracked but has no matching resource handles
    #[error("{}", no_resources_message(.namespace, .app_key))]
    NoResources {
        /// Name of the cluster
        cluster: String,
        /// The namespace without resources
        namespace: String,
        /// Application filter in effect, if any
        app_key: Option<String>,
    },

    /// No cluster registered under the given name
    #[error("cluster [{name}] not found")]
    ClusterNotFound {
        /// The requested cluster name
        name: String,
    },

    /// A cluster with the same name or id is already registered
    #[error("cluster with {field} [{value}] is already registered")]
    DuplicateCluster {
        /// Which identity field collided ("name" or "id")
        field: &'static str,
        /// The colliding value
        value: String,
    },

    /// A non-hyper-converged cluster exposed no storage-less nodes
    #[error("no storage-less nodes found in cluster [{cluster}] with config-path [{config_path}]")]
    NoStorageLessNodes {
        /// Name of the cluster
        cluster: String,
        /// Kubeconfig path of the cluster
        config_path: String,
    },

    /// Labelling a storage-less node failed
    #[error(
        "failed to add label [{key}={value}] on node [{node}] of config-path [{config_path}]: {source}"
    )]
    NodeLabel {
        /// Node being labelled
        node: String,
        /// Kubeconfig path of the node's cluster
        config_path: String,
        /// Label key
        key: String,
        /// Label value
        value: String,
        /// Underlying scheduler error
        source: Box<Error>,
    },

    /// The node driver cannot be refreshed after a context switch
    #[error("failed to get SSH node driver [{driver}] while switching to config-path [{path}]")]
    UnsupportedNodeDriver {
        /// Name of the configured node driver
        driver: String,
        /// Kubeconfig path being switched to
        path: String,
    },

    /// A cluster context switch failed
    #[error("failed to switch cluster context to config-path [{path}] at step [{step}]: {source}")]
    ContextSwitch {
        /// The step that failed
        step: SwitchStep,
        /// Kubeconfig path being switched to
        path: String,
        /// Underlying collaborator error
        source: Box<Error>,
    },

    /// A scheduler, volume driver or node driver call failed
    #[error("{operation} failed: {message}")]
    Driver {
        /// Collaborator operation (e.g., "wait-for-running")
        operation: String,
        /// Error reported by the collaborator
        message: String,
    },

    /// Scheduling onto a series of namespaces stopped part way
    #[error("scheduling stopped after namespaces {scheduled:?}: {source}")]
    PartialSchedule {
        /// Namespaces scheduled before the failure
        scheduled: Vec<String>,
        /// The failure that stopped the series
        source: Box<Error>,
    },

    /// Error annotated with the call site it passed through
    #[error("{source}\n  at {location} <-> {}", debug_message(.debug))]
    Traced {
        /// `file:line` of the call site
        location: String,
        /// Optional debug payload describing the request involved
        debug: Option<String>,
        /// The wrapped error
        source: Box<Error>,
    },
}

fn no_resources_message(namespace: &str, app_key: &Option<String>) -> String {
    match app_key {
        Some(app_key) => format!(
            "no resources of the namespace [{}] with the app-key [{}] found",
            namespace, app_key
        ),
        None => format!("no resources of the namespace [{}] found", namespace),
    }
}

fn debug_message(debug: &Option<String>) -> String {
    match debug {
        Some(debug) => format!("debug message: {}", debug),
        None => "no debug message".to_string(),
    }
}

impl Error {
    /// Create a collaborator error for the given operation
    pub fn driver(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Driver {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap this error with a call site and optional debug payload
    pub fn at(self, location: &Location<'_>, debug: Option<String>) -> Self {
        Self::Traced {
            location: format!("{}:{}", location.file(), location.line()),
            debug,
            source: Box::new(self),
        }
    }

    /// The innermost error beneath any call-site wrappers
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Traced { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the error was detected from configuration alone
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            Error::NamespaceTooLong { .. }
                | Error::MissingAppSpec { .. }
                | Error::EmptyAppKeys
                | Error::ClusterMismatch { .. }
                | Error::Config { .. }
        )
    }

    /// Whether the error was detected from bookkeeping lookups
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.root(),
            Error::NamespaceNotTracked { .. }
                | Error::NoResources { .. }
                | Error::ClusterNotFound { .. }
                | Error::DuplicateCluster { .. }
        )
    }
}

/// Call-site annotation for results
///
/// Every layer that propagates an error records where it passed through, so a
/// failure surfacing at the top of a test still names the request involved.
pub trait ResultExt<T> {
    /// Wrap the error with the caller's location
    fn traced(self) -> Result<T, Error>;

    /// Wrap the error with the caller's location and a debug payload
    fn traced_with<F>(self, debug: F) -> Result<T, Error>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, Error> {
    #[track_caller]
    fn traced(self) -> Result<T, Error> {
        let location = Location::caller();
        self.map_err(|e| e.at(location, None))
    }

    #[track_caller]
    fn traced_with<F>(self, debug: F) -> Result<T, Error>
    where
        F: FnOnce() -> String,
    {
        let location = Location::caller();
        self.map_err(|e| e.at(location, Some(debug())))
    }
}
