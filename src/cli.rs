//! Command-line interface definitions for devsync.
//!
//! This module contains all CLI argument parsing structures using clap's derive macros.
//! The CLI definitions are shared between the main binary and build tools (like xtask)
//! for man page generation.
//!
//! Note: Field-level documentation is provided via clap attributes (#[arg(help = "...")]),
//! so we allow missing_docs for this module to avoid redundant documentation.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Main CLI structure for devsync.
#[derive(Parser)]
#[command(
    name = "devsync",
    version = crate::VERSION,
    about = "Connect to nearby devices and detect what changed since the last sync",
    long_about = "Connects to every reachable device over USB, the network bridge or SSH, \
                  then diffs a recursive listing of each side against its previous baseline"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress informational messages
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// All available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Connect to every reachable device and report changes on both sides
    Detect {
        /// Print reports as JSON on stdout
        #[arg(long)]
        json: bool,

        /// Never wait for a device's authorization prompt
        #[arg(long)]
        non_interactive: bool,

        /// Drop baselines first so everything is reported as added
        #[arg(long)]
        reset: bool,
    },

    /// Inspect or edit the device registry
    Devices {
        #[command(subcommand)]
        action: Option<DevicesAction>,
    },

    /// Show the sync rules
    Rules {
        /// Write a placeholder rules file if none exists
        #[arg(long)]
        init: bool,
    },

    /// Get and set configuration options
    Config {
        /// Configuration key (e.g., transport.tcp_port)
        key: Option<String>,

        /// Value to set
        value: Option<String>,

        /// Remove the configuration key
        #[arg(long)]
        unset: bool,

        /// List all configuration
        #[arg(short, long)]
        list: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Device registry subcommands.
#[derive(Subcommand)]
pub enum DevicesAction {
    /// List devices known on the current network (default)
    List {
        /// Include every network
        #[arg(short, long)]
        all: bool,
    },

    /// Connect to an SSH host once and remember it on the current network
    AddShell {
        /// Login user
        #[arg(short, long)]
        user: String,

        /// Host name or address
        #[arg(long)]
        host: String,

        /// Operating system label stored with the host
        #[arg(long, default_value = "linux")]
        os: String,
    },

    /// Forget a device on the current network
    Forget {
        /// Device id
        id: String,

        /// Forget it on every network
        #[arg(long)]
        all_networks: bool,
    },
}
