//! Infrastructure layer: queue storage, scheduling, secondary-store ports, config.

pub mod config;
pub mod ports;
pub mod queue;

pub use config::{ConfigError, WorkerConfig};
pub use ports::{InMemoryIndex, ProjectionPort};
