//! plughost - runtime plugin framework for a host application

pub mod config;
pub mod error;
pub mod host;
pub mod plugins;
pub mod store;

pub use config::Config;
pub use error::{HostError, Result};
