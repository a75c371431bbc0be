//! Supervisor Layer for System Monitoring and Recovery
//!
//! This module provides automated supervision infrastructure:
//! - Managed service contract and lifecycle states
//! - Health-check driven degradation and restart with backoff
//! - Named circuit breakers for external dependencies

pub mod service;
pub mod service_supervisor;

pub use service::{
    ManagedService, ServiceOptions, ServiceSnapshot, ServiceState, SupervisorEvent,
    SupervisorSettings,
};
pub use service_supervisor::{ServiceSupervisor, SupervisorStatus};
