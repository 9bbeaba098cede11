//! Command implementations behind the CLI.

pub mod config;
pub mod detect;
pub mod devices;
pub mod rules;
