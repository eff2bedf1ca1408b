//! Core application infrastructure

pub mod bus;
pub mod cli;
pub mod config;
pub mod constants;
pub mod shutdown;

pub use crate::app::CoreApp;
pub use bus::{Bus, BusEvent, BusSubscriber, BusTopic};
pub use cli::{CliConfig, Commands};
pub use config::{AppConfig, AuthConfig, ServerConfig};
pub use shutdown::ShutdownService;
