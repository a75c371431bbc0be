//! Process-wide readiness table
//!
//! One entry per service name, overwritten on every status change. Feeds the
//! liveness/readiness probe and the feature flag evaluator.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Last reported status of a named service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Readiness as seen by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    Ready,
    Error,
    /// Critical service that has not reported yet
    Initializing,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceReadiness {
    pub state: ReadinessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Overall readiness response
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub services: BTreeMap<String, ServiceReadiness>,
}

#[derive(Debug, Default)]
pub struct ReadinessRegistry {
    services: DashMap<String, ServiceStatus>,
    critical: HashSet<String>,
}

impl ReadinessRegistry {
    pub fn new<I, S>(critical_services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            services: DashMap::new(),
            critical: critical_services.into_iter().map(Into::into).collect(),
        }
    }

    pub fn shared<I, S>(critical_services: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self::new(critical_services))
    }

    pub fn set_ready(&self, name: &str) {
        let previous = self.services.insert(
            name.to_string(),
            ServiceStatus {
                name: name.to_string(),
                ready: true,
                error: None,
                last_updated: Utc::now(),
            },
        );
        if !previous.map(|s| s.ready).unwrap_or(false) {
            debug!("Service {} is ready", name);
        }
    }

    pub fn set_error(&self, name: &str, reason: &str) {
        self.services.insert(
            name.to_string(),
            ServiceStatus {
                name: name.to_string(),
                ready: false,
                error: Some(reason.to_string()),
                last_updated: Utc::now(),
            },
        );
        warn!("Service {} not ready: {}", name, reason);
    }

    /// False for names that never reported
    pub fn is_ready(&self, name: &str) -> bool {
        self.services.get(name).map(|s| s.ready).unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.services.get(name).map(|s| s.clone())
    }

    pub fn all_critical_services_ready(&self) -> bool {
        self.critical.iter().all(|name| self.is_ready(name))
    }

    pub fn critical_services(&self) -> impl Iterator<Item = &String> {
        self.critical.iter()
    }

    pub fn get_status(&self) -> ReadinessReport {
        let mut services: BTreeMap<String, ServiceReadiness> = self
            .services
            .iter()
            .map(|entry| {
                let status = entry.value();
                (
                    status.name.clone(),
                    ServiceReadiness {
                        state: if status.ready {
                            ReadinessState::Ready
                        } else {
                            ReadinessState::Error
                        },
                        error: status.error.clone(),
                        last_updated: Some(status.last_updated),
                    },
                )
            })
            .collect();

        for name in &self.critical {
            services
                .entry(name.clone())
                .or_insert_with(|| ServiceReadiness {
                    state: ReadinessState::Initializing,
                    error: None,
                    last_updated: None,
                });
        }

        ReadinessReport {
            ready: self.all_critical_services_ready(),
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_service_is_not_ready() {
        let registry = ReadinessRegistry::new(Vec::<String>::new());
        assert!(!registry.is_ready("rpc"));
    }

    #[test]
    fn test_set_ready_then_error_overwrites() {
        let registry = ReadinessRegistry::new(["rpc"]);
        registry.set_ready("rpc");
        assert!(registry.is_ready("rpc"));

        registry.set_error("rpc", "all endpoints down");
        assert!(!registry.is_ready("rpc"));
        assert_eq!(
            registry.get("rpc").unwrap().error.as_deref(),
            Some("all endpoints down")
        );
    }

    #[test]
    fn test_critical_readiness() {
        let registry = ReadinessRegistry::new(["rpc", "database"]);
        registry.set_ready("rpc");
        assert!(!registry.all_critical_services_ready());

        registry.set_ready("database");
        registry.set_error("reconciliation", "sweep failing");
        assert!(registry.all_critical_services_ready());
    }

    #[test]
    fn test_status_lists_uninitialized_critical_services() {
        let registry = ReadinessRegistry::new(["rpc", "database"]);
        registry.set_ready("rpc");

        let report = registry.get_status();
        assert!(!report.ready);
        assert_eq!(report.services["rpc"].state, ReadinessState::Ready);
        assert_eq!(
            report.services["database"].state,
            ReadinessState::Initializing
        );
    }
}
