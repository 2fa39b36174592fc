//! Common types for convoy: errors, configuration and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::OrchestratorConfig;
pub use error::{Error, ResultExt, SwitchStep};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum character length of a Kubernetes namespace name
pub const MAX_NAMESPACE_LEN: usize = 63;

/// Config path of the cluster this process runs in
pub const IN_CLUSTER_CONFIG_PATH: &str = "";

/// Volume parameter carrying the auth token read from the configured config map
pub const AUTH_TOKEN_PARAM: &str = "auth-token";

/// Volume parameter asking the volume driver to refresh its endpoint
pub const REFRESH_ENDPOINT_PARAM: &str = "refresh-endpoint";

/// Label applied to storage-less nodes when a cluster declares none
pub const DEFAULT_STORAGE_LESS_NODE_LABEL: (&str, &str) = ("convoy.io/storage-less", "true");
