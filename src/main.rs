use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::{Generator, generate};
use colored::Colorize;
use devsync::cli::{Cli, Commands, DevicesAction};
use devsync::output::{self, Verbosity};
use devsync::{SyncContext, commands};
use std::io;
use std::process;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding the log filter
const LOG_ENV: &str = "DEVSYNC_LOG";

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    if cli.quiet {
        output::set_verbosity(Verbosity::Quiet);
    } else if cli.verbose {
        output::set_verbosity(Verbosity::Verbose);
    }

    // Completion needs no settings
    if let Commands::Completion { shell } = cli.command {
        print_completions(shell, &mut Cli::command());
        return Ok(());
    }

    let mut ctx = SyncContext::new()?;

    match cli.command {
        Commands::Detect {
            json,
            non_interactive,
            reset,
        } => {
            ctx.non_interactive = non_interactive;
            let options = commands::detect::DetectOptions { json, reset };
            commands::detect::execute(&ctx, &options)?;
        }
        Commands::Devices { action } => match action {
            None => commands::devices::list(&ctx, false)?,
            Some(DevicesAction::List { all }) => commands::devices::list(&ctx, all)?,
            Some(DevicesAction::AddShell { user, host, os }) => {
                commands::devices::add_shell(&ctx, &user, &host, &os)?;
            }
            Some(DevicesAction::Forget { id, all_networks }) => {
                commands::devices::forget(&ctx, &id, all_networks)?;
            }
        },
        Commands::Rules { init } => commands::rules::execute(&ctx, init)?,
        Commands::Config {
            key,
            value,
            unset,
            list,
        } => commands::config::execute(&mut ctx, key.as_deref(), value, unset, list)?,
        Commands::Completion { .. } => {}
    }

    Ok(())
}

fn print_completions<G: Generator>(g: G, cmd: &mut clap::Command) {
    generate(g, cmd, cmd.get_name().to_string(), &mut io::stdout());
}
