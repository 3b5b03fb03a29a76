//! Health-check surface.
//!
//! A file named `HEALTH_CHECK` under the data dir carries a single digit:
//! `0` failed, `1` starting, `2` serving. Operators and orchestration poll
//! the file; transition to `2` gates application traffic.

use std::path::{Path, PathBuf};
use tracing::warn;

pub const HEALTH_CHECK_FILE: &str = "HEALTH_CHECK";

/// Node health states, in startup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Failed,
    Starting,
    Serving,
}

impl HealthStatus {
    fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Failed => "0",
            HealthStatus::Starting => "1",
            HealthStatus::Serving => "2",
        }
    }
}

/// Writes health transitions to the data dir. A node without a data dir
/// (tests, simulation) skips the file silently.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    path: Option<PathBuf>,
}

impl HealthCheck {
    pub fn new(data_dir: Option<&Path>) -> HealthCheck {
        HealthCheck {
            path: data_dir.map(|dir| dir.join(HEALTH_CHECK_FILE)),
        }
    }

    pub fn set(&self, status: HealthStatus) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = std::fs::write(path, status.as_str()) {
            warn!(path = %path.display(), error = %e, "Could not write health-check file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_health_transitions_are_visible() {
        let dir = TempDir::new().unwrap();
        let health = HealthCheck::new(Some(dir.path()));
        health.set(HealthStatus::Starting);
        let path = dir.path().join(HEALTH_CHECK_FILE);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
        health.set(HealthStatus::Serving);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2");
        health.set(HealthStatus::Failed);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn test_no_data_dir_is_a_noop() {
        HealthCheck::new(None).set(HealthStatus::Serving);
    }
}
