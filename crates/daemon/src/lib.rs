// Service modules (daemon functionality)
pub mod process;
pub mod service_config;

// Re-exports for consumers
pub use process::{build_coordinator, spawn_service, start_service, Coordinator, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
pub use service_config::{ConfigFile, Overrides, ServiceConfigError};
