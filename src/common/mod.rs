//! Common utilities and types shared across dcfed

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, GossipConfig, ServerConfig};
pub use error::{Error, Result};
pub use utils::{parse_duration, random_stagger};
