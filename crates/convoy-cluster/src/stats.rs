//! Per-namespace execution statistics

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Orchestration step an execution record describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Validation of one resource handle
    Validate,
    /// Destruction of one resource handle
    Destroy,
    /// Destruction of a whole namespace during cleanup
    Cleanup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Validate => "validate",
            Operation::Destroy => "destroy",
            Operation::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Outcome and timing of one orchestration step
#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    /// What ran
    pub operation: Operation,
    /// Whether it completed without error
    pub succeeded: bool,
    /// Namespace it ran against
    pub namespace: String,
    /// Resources involved, e.g. `app-key` and `uid`
    pub resources: BTreeMap<String, String>,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Time until [`ExecutionRecord::finish`]
    pub duration: Duration,
}

impl ExecutionRecord {
    /// Start timing an operation
    pub fn start(operation: Operation, namespace: impl Into<String>) -> Self {
        Self {
            operation,
            succeeded: false,
            namespace: namespace.into(),
            resources: BTreeMap::new(),
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Attach a resource attribute
    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    /// Stop timing and record the outcome
    pub fn finish(mut self, succeeded: bool) -> Self {
        self.succeeded = succeeded;
        self.duration = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        self
    }

    /// `success` or `failure`
    pub fn status(&self) -> &'static str {
        if self.succeeded {
            "success"
        } else {
            "failure"
        }
    }
}

impl fmt::Display for ExecutionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of namespace [{}] {} in {:?} (started {})",
            self.operation,
            self.namespace,
            self.status(),
            self.duration,
            self.started_at.to_rfc3339()
        )?;
        for (key, value) in &self.resources {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_records_outcome_and_duration() {
        let record = ExecutionRecord::start(Operation::Destroy, "ns-a")
            .with_resource("app-key", "postgres-3-0")
            .finish(true);

        assert!(record.succeeded);
        assert_eq!(record.status(), "success");
        assert!(record.started_at <= Utc::now());
        assert_eq!(record.resources["app-key"], "postgres-3-0");
    }

    #[test]
    fn display_names_operation_status_and_resources() {
        let record = ExecutionRecord::start(Operation::Validate, "ns-b")
            .with_resource("uid", "u-1")
            .finish(false);

        let line = record.to_string();
        assert!(line.starts_with("validate of namespace [ns-b] failure in "));
        assert!(line.ends_with(" uid=u-1"));
    }
}
