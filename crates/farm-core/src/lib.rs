//! Core types and pure logic for remote job execution.

pub mod config;
pub mod layout;
pub mod script;
pub mod stats;
pub mod status;
pub mod tool;
pub mod types;

pub use config::{Config, Transport};
pub use layout::JobLayout;
pub use types::*;
