use crate::SyncContext;
use crate::config::rules::{Side, SyncConfiguration};
use crate::coordinator::{SyncCoordinator, SyncReport};
use crate::detect::{ChangeSet, DirectoryChange, ParseError};
use crate::network;
use crate::orchestrator::{
    ConnectionOrchestrator, NonInteractivePrompt, OrchestratorSettings, StdinPrompt, TrustPrompt,
    disconnect_all,
};
use crate::output;
use crate::registry::DeviceRegistry;
use crate::transport::{AdbBridge, Credential, LocalSession, SshDialer, Transport};
use crate::utils::formatters::{format_directory, format_entry};
use anyhow::{Result, bail};
use colored::Colorize;
use std::io::IsTerminal;
use tracing::debug;

/// Flags of the detect command
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOptions {
    /// Print reports as JSON
    pub json: bool,
    /// Drop baselines before detecting
    pub reset: bool,
}

/// Connect every reachable device and report changes on both sides
///
/// A device whose detection fails is reported and skipped; the others still
/// run. The command fails afterwards if any device failed.
///
/// # Errors
///
/// Returns an error if settings, rules or the credential cannot be loaded,
/// the device bridge is missing, or detection failed for any device.
pub fn execute(ctx: &SyncContext, options: &DetectOptions) -> Result<()> {
    let config = &ctx.config;
    ctx.ensure_state_dir()?;

    let rules = SyncConfiguration::load(&config.rules_path())?;
    rules.check_complete()?;
    if rules.roots(Side::Local).is_empty() && rules.roots(Side::Remote).is_empty() {
        output::warning(&format!(
            "No active sync rules in {}; devices will be connected but nothing is listed",
            config.rules_path().display()
        ));
    }

    let credential = Credential::load(&config.core.credential_path)?;
    let network = match network::network_identity(config.transport.network_identity.as_deref()) {
        Ok(network) => Some(network),
        Err(e) => {
            output::warning(&format!("Known devices cannot be reconnected: {e:#}"));
            None
        }
    };
    let registry = DeviceRegistry::open(&config.registry_path(), &config.core.state_dir);
    let bridge = AdbBridge::locate(&config.transport.adb_binary)?;
    let dialer = SshDialer::new(&config.transport.ssh_binary);

    let interactive = !ctx.non_interactive && std::io::stdin().is_terminal();
    let prompt: &dyn TrustPrompt = if interactive {
        &StdinPrompt
    } else {
        &NonInteractivePrompt
    };
    let settings = OrchestratorSettings {
        auth_timeout: config.transport.auth_timeout(),
        settle_delay: config.transport.settle_delay(),
        tcp_port: config.transport.tcp_port,
        network_interface: config.transport.network_interface.clone(),
    };

    let orchestrator = ConnectionOrchestrator::new(bridge, dialer, prompt, &registry, network, settings);
    let connections = orchestrator.connect(&credential);
    if connections.is_empty() {
        output::info("No devices reachable");
    }

    let host = LocalSession::new();
    let coordinator = SyncCoordinator::new(&rules, &config.core.state_dir, &config.detect.device_state_dir);
    let devices: Vec<(&str, &dyn Transport)> = connections
        .iter()
        .map(|c| (c.identity.id.as_str(), c.sessions.active()))
        .collect();
    let (reports, failures) = detect_all(&coordinator, &host, &devices, options.reset);
    drop(devices);
    disconnect_all(connections);

    if options.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    for (device, error) in &failures {
        if error.downcast_ref::<ParseError>().is_some() {
            output::error(&format!("{device}: unexpected listing output, baseline kept: {error:#}"));
        } else {
            output::error(&format!("{device}: {error:#}"));
        }
    }
    if !failures.is_empty() {
        bail!("Detection failed for {} of {} device(s)", failures.len(), failures.len() + reports.len());
    }
    Ok(())
}

/// Run detection for each device in turn; one failure does not stop the rest
fn detect_all(
    coordinator: &SyncCoordinator<'_>,
    host: &dyn Transport,
    devices: &[(&str, &dyn Transport)],
    reset: bool,
) -> (Vec<SyncReport>, Vec<(String, anyhow::Error)>) {
    let mut reports = Vec::new();
    let mut failures = Vec::new();

    for (id, device) in devices {
        output::device_heading(id, "detecting changes");
        if reset {
            if let Err(e) = coordinator.reset(host, *device, id) {
                failures.push(((*id).to_string(), e));
                continue;
            }
        }
        match coordinator.run(host, *device, id) {
            Ok(report) => {
                debug!(device = %id, empty = report.is_empty(), "Device report ready");
                reports.push(report);
            }
            Err(e) => failures.push(((*id).to_string(), e)),
        }
    }
    (reports, failures)
}

/// Print one device's report
fn print_report(report: &SyncReport) {
    println!("{}", report.device.cyan().bold());
    if report.is_empty() {
        println!("  {}", "no changes".dimmed());
        return;
    }
    print_side("device", &report.device_changes);
    print_side("host", &report.host_changes);
}

/// Print the changes of one side, if any
fn print_side(label: &str, changes: &ChangeSet) {
    if changes.is_empty() {
        return;
    }
    println!(" {}", format!("{label}:").bold());
    for (path, change) in changes {
        println!("  {}", format_directory(path, change));
        if let DirectoryChange::Entries(entries) = change {
            for entry in entries {
                println!("      {}", format_entry(entry));
            }
        }
    }
}
