pub mod config;
pub mod duration;

pub use config::{ClusterBackend, KeelConfig};
pub use duration::{DurationError, parse_duration};
