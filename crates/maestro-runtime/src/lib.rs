//! # Maestro Runtime
//!
//! Host-side glue for running compositions:
//! - an [`ActionClient`](maestro_core::conduct::ActionClient) backed by an
//!   in-memory handler registry
//! - the [`Driver`] loop implementing the host half of the continuation
//!   protocol (invoke, merge, inject `$resume`, re-enter)
//! - unified YAML configuration and tracing bootstrap
//!
//! This crate does NOT implement a transport: production hosts supply their
//! own `ActionClient` over whatever invocation backend they use.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod driver;

pub use bootstrap::init_tracing_if_needed;
pub use client::{ActionHandler, InMemoryActionClient};
pub use config::{
    load_config, parse_config, AppConfig, ConfigError, ConductorSection, DriverSection,
    LowerSection, MaestroConfig, ObservabilityConfig,
};
pub use driver::{Driver, DriverConfig, DriverError};
