//! Shared substrate: errors, time source, event publication, instance cache

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod registry;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::ResilienceConfig;
pub use error::{
    ConfigError, ConfigResult, ErrorClass, ExecuteError, ResilienceError, ResilienceResult,
};
pub use event::EventPublisher;
pub use registry::NamedRegistry;
