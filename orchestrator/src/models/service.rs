//! Service descriptors

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Role a service plays in the deployment target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Primary application process
    App,

    /// Front-end reverse proxy
    Proxy,
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceRole::App => f.write_str("app"),
            ServiceRole::Proxy => f.write_str("proxy"),
        }
    }
}

/// A managed service and the commands that drive it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Logical (unit) name
    pub name: String,

    /// Role, used to attribute failures
    pub role: ServiceRole,

    /// Restart command argv
    pub restart: Vec<String>,

    /// Exits zero iff the service is active
    pub is_active: Vec<String>,

    /// Human-readable status, captured for diagnostics
    pub status: Vec<String>,

    /// Bounded wait for the service to report active after a restart
    pub start_timeout: Duration,
}

impl ServiceDescriptor {
    /// Describe a service driven by a systemctl-like manager.
    ///
    /// `privilege` is prepended to every command (e.g. `sudo -n`).
    pub fn managed(
        name: &str,
        role: ServiceRole,
        privilege: &[String],
        manager: &str,
        start_timeout: Duration,
    ) -> Self {
        let command = |op: &[&str]| -> Vec<String> {
            privilege
                .iter()
                .cloned()
                .chain(std::iter::once(manager.to_string()))
                .chain(op.iter().map(|s| s.to_string()))
                .chain(std::iter::once(name.to_string()))
                .collect()
        };

        Self {
            name: name.to_string(),
            role,
            restart: command(&["restart"]),
            is_active: command(&["is-active", "--quiet"]),
            status: command(&["status", "--no-pager"]),
            start_timeout,
        }
    }

    /// The attributable start failure for this service
    pub fn start_failure(&self, reason: impl Into<String>) -> DeployError {
        let service = self.name.clone();
        let reason = reason.into();
        match self.role {
            ServiceRole::App => DeployError::AppServiceFailed { service, reason },
            ServiceRole::Proxy => DeployError::ProxyServiceFailed { service, reason },
        }
    }
}
