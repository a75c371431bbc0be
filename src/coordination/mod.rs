//! Coordination Layer for 24/7 Operation
//!
//! This module provides coordination infrastructure shared by every service:
//! - Named circuit breakers
//! - Periodic task scheduling with stop channels
//! - Single-flight guards for sweeps
//! - Graceful shutdown handling

pub mod circuit_breaker;
pub mod shutdown;
pub mod single_flight;
pub mod ticker;

pub use circuit_breaker::{
    Admission, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use shutdown::{install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownSignal};
pub use single_flight::{FlightGuard, SingleFlight};
pub use ticker::PeriodicTask;
