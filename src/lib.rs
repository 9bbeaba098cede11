#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
// Allow pedantic strict lints that create false positives in this codebase
#![allow(clippy::arithmetic_side_effects)] // Counters and size calculations cannot overflow
#![allow(clippy::float_arithmetic)] // Required for size formatting
#![allow(clippy::indexing_slicing)] // Bounds checked by logic

//! # Devsync - Device Connection and Change Detection
//!
//! Devsync connects to every reachable device (USB, network bridge or SSH)
//! and reports what changed on each side of a sync pair since the last run.
//!
//! ## Features
//!
//! - **Connection Orchestration**: USB handshakes with bounded retry, network
//!   channel enablement, and reconnects from a per-network device registry
//! - **Failure Taxonomy**: driver errors classified as unavailable, busy,
//!   pending authorization or unclassified, each with its own recovery
//! - **Listing-Based Detection**: one recursive listing per side, diffed against
//!   the previous run's baseline on the same machine that produced it
//! - **Directory Shadowing**: a wholly added or removed directory implies
//!   everything underneath
//!
//! ## Architecture
//!
//! - [`transport`]: Session capability trait and its USB, network, shell and local variants
//! - [`orchestrator`]: Handshake policy and connection results
//! - [`registry`]: Device address book keyed by network identity
//! - [`network`]: Network identity resolution
//! - [`detect`]: Listing diff parser and the change set model
//! - [`snapshot`]: Baseline storage on either side
//! - [`coordinator`]: Host and device detection for one sync pair
//! - [`config`]: Settings and sync rules
//! - [`commands`]: Command implementations behind the CLI
//!
//! ## Example Usage
//!
//! ```no_run
//! use devsync::SyncContext;
//!
//! # fn main() -> anyhow::Result<()> {
//! let ctx = SyncContext::new()?;
//! devsync::commands::detect::execute(&ctx, &devsync::commands::detect::DetectOptions::default())?;
//! # Ok(())
//! # }
//! ```

/// Command-line interface definitions (argument parsing structures).
pub mod cli;

/// Command implementations behind the CLI.
pub mod commands;

/// Settings and sync rules.
pub mod config;

/// Host and device detection for one sync pair.
pub mod coordinator;

/// Listing diff parsing and change sets.
pub mod detect;

/// Advisory locks on registry and detection state.
pub mod lock;

/// Network identity resolution.
pub mod network;

/// Device connection orchestration.
pub mod orchestrator;

/// Output formatting and verbosity.
pub mod output;

/// Per-network device address book.
pub mod registry;

/// Baseline listing storage.
pub mod snapshot;

/// Device sessions and process plumbing.
pub mod transport;

/// Utility functions and helpers.
pub mod utils;

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Current version of the devsync binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default state directory name within the home directory.
pub const DEFAULT_STATE_DIR: &str = ".devsync";

/// Default configuration file path relative to home directory.
pub const DEFAULT_CONFIG_PATH: &str = ".config/devsync/config.toml";

/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "DEVSYNC_CONFIG_PATH";

/// Central context for all devsync operations.
///
/// Holds the loaded settings and where they came from. Commands receive it
/// instead of reading configuration themselves.
///
/// # Examples
///
/// ```no_run
/// use devsync::SyncContext;
///
/// # fn main() -> anyhow::Result<()> {
/// // Settings from the default location
/// let ctx = SyncContext::new()?;
///
/// // Settings from an explicit file (for testing)
/// let ctx = SyncContext::new_explicit("/tmp/devsync/config.toml".into())?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SyncContext {
    /// Path to the configuration file.
    pub config_path: PathBuf,

    /// Loaded configuration settings.
    pub config: config::Config,

    /// Whether to run in non-interactive mode (no prompts).
    pub non_interactive: bool,
}

impl SyncContext {
    /// Creates a new `SyncContext` by loading the configuration from the default path.
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined or if the configuration
    /// file cannot be read or created.
    pub fn new() -> Result<Self> {
        // Check environment variable for config path first
        let config_path = if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            PathBuf::from(path)
        } else {
            let home = dirs::home_dir().context("Could not find home directory")?;
            home.join(DEFAULT_CONFIG_PATH)
        };

        let config = config::Config::load(&config_path)?;

        // Validate configuration and warn about issues
        let validator = config::validator::ConfigValidator::new();
        if let Err(e) = validator.validate_config_file(&config_path) {
            output::warning(&format!("Configuration validation failed: {e}"));
        }

        Ok(Self {
            config_path,
            config,
            non_interactive: false,
        })
    }

    /// Creates a new `SyncContext` from an explicit configuration file, never prompting.
    ///
    /// A missing file is created with defaults.
    ///
    /// # Errors
    /// Returns an error if the configuration cannot be loaded or created.
    pub fn new_explicit(config_path: PathBuf) -> Result<Self> {
        let config = config::Config::load(&config_path)?;
        Ok(Self {
            config_path,
            config,
            non_interactive: true,
        })
    }

    /// Ensures that the local state directory exists.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn ensure_state_dir(&self) -> Result<()> {
        let state_dir = &self.config.core.state_dir;
        std::fs::create_dir_all(state_dir).with_context(|| {
            format!("Failed to create state directory: {}", state_dir.display())
        })
    }
}
