use crate::SyncContext;
use crate::network;
use crate::orchestrator::{ShellDialer, shell_identity};
use crate::output;
use crate::registry::{AddressBook, DeviceRegistry, RegistryEntry, ShellHost};
use crate::transport::{Credential, SshDialer, Transport};
use anyhow::{Context, Result};
use colored::Colorize;

/// Registry configured for this context
fn open_registry(ctx: &SyncContext) -> DeviceRegistry {
    DeviceRegistry::open(&ctx.config.registry_path(), &ctx.config.core.state_dir)
}

/// Identity of the network this host is on
fn current_network(ctx: &SyncContext) -> Result<String> {
    network::network_identity(ctx.config.transport.network_identity.as_deref())
        .context("Cannot determine the current network; set transport.network_identity")
}

/// List known devices on the current network, or on every network with `all`
///
/// # Errors
///
/// Returns an error if the registry cannot be read, or the current network
/// cannot be determined without `all`.
pub fn list(ctx: &SyncContext, all: bool) -> Result<()> {
    let registry = open_registry(ctx);
    let data = registry.load()?;

    if all {
        if data.is_empty() {
            output::info("No devices known on any network");
        }
        for (name, book) in &data {
            println!("{}", name.bold());
            print_book(book);
        }
        return Ok(());
    }

    let current = match current_network(ctx) {
        Ok(current) => current,
        Err(e) => {
            let known = registry.networks()?;
            if !known.is_empty() {
                output::info(&format!("Known networks: {}", known.join(", ")));
            }
            return Err(e);
        }
    };
    match data.get(&current) {
        Some(book) => {
            println!("{} {}", current.bold(), "(current)".dimmed());
            print_book(book);
        }
        None => output::info(&format!("No devices known on network {current}")),
    }
    Ok(())
}

/// Print every entry of one network
fn print_book(book: &AddressBook) {
    for (kind, devices) in book {
        for (id, entry) in devices {
            println!("  {:<20} {:<8} {}", id, kind.to_string(), describe_entry(entry));
        }
    }
}

/// Where a registry entry points
fn describe_entry(entry: &RegistryEntry) -> String {
    match entry {
        RegistryEntry::Address(address) => address.clone(),
        RegistryEntry::Shell(host) => format!("{}@{} ({})", host.user, host.ip, host.os),
    }
}

/// Connect to an SSH host once and remember it on the current network
///
/// # Errors
///
/// Returns an error if the credential is missing, the network is unknown,
/// the host cannot be reached or identified, or the registry cannot be written.
pub fn add_shell(ctx: &SyncContext, user: &str, host: &str, os: &str) -> Result<()> {
    let credential = Credential::load(&ctx.config.core.credential_path)?;
    let network = current_network(ctx)?;
    let dialer = SshDialer::new(&ctx.config.transport.ssh_binary);

    let mut session = dialer
        .dial(user, host, &credential, ctx.config.transport.auth_timeout())
        .map_err(|e| anyhow::anyhow!("{}", e.user_message()))?;
    let result = remember_shell_host(&open_registry(ctx), &network, session.as_ref(), user, host, os);
    if let Err(e) = session.close() {
        tracing::warn!(error = %e, "Failed to close session");
    }

    let id = result?;
    output::success(&format!("Remembered {id} ({user}@{host}) on network {network}"));
    Ok(())
}

/// Identify a connected shell host and store it; returns its id
fn remember_shell_host(
    registry: &DeviceRegistry,
    network: &str,
    session: &dyn Transport,
    user: &str,
    host: &str,
    os: &str,
) -> Result<String> {
    let identity = shell_identity(session, host, os)?;
    registry.upsert_shell_host(
        network,
        &identity.id,
        ShellHost {
            user: user.to_string(),
            name: identity.id.clone(),
            ip: host.to_string(),
            os: os.to_string(),
        },
    )?;
    Ok(identity.id)
}

/// Forget a device on the current network, or everywhere with `all_networks`
///
/// # Errors
///
/// Returns an error if the registry cannot be written, or the current
/// network cannot be determined without `all_networks`.
pub fn forget(ctx: &SyncContext, id: &str, all_networks: bool) -> Result<()> {
    let network = if all_networks {
        None
    } else {
        Some(current_network(ctx)?)
    };

    let removed = open_registry(ctx).forget(network.as_deref(), id)?;
    if removed == 0 {
        output::warning(&format!("Device {id} is not in the registry"));
    } else {
        output::success(&format!("Forgot {id} ({removed} entries)"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use tempfile::TempDir;

    struct Hostname(&'static str);

    impl Transport for Hostname {
        fn id(&self) -> &str {
            "pi@192.168.1.5"
        }

        fn execute(&self, _command: &str) -> Result<String> {
            Ok(format!("{}\n", self.0))
        }

        fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn write_file(&self, _path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn context(temp: &TempDir) -> SyncContext {
        let mut ctx = SyncContext::new_explicit(temp.path().join("config.toml")).unwrap();
        ctx.config.core.state_dir = temp.path().join("state");
        ctx.config.transport.network_identity = Some("home".into());
        ctx
    }

    #[test]
    fn test_remember_shell_host_uses_reported_name() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let registry = open_registry(&ctx);

        let id = remember_shell_host(&registry, "home", &Hostname("nas"), "pi", "192.168.1.5", "linux").unwrap();
        assert_eq!(id, "nas");
        let hosts = registry.shell_hosts("home").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].1.user, "pi");
        assert_eq!(hosts[0].1.ip, "192.168.1.5");
    }

    #[test]
    fn test_silent_host_is_not_stored() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let registry = open_registry(&ctx);

        assert!(remember_shell_host(&registry, "home", &Hostname(""), "pi", "192.168.1.5", "linux").is_err());
        assert!(registry.load().unwrap().is_empty());
    }

    #[test]
    fn test_forget_scoped_to_current_network() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let registry = open_registry(&ctx);
        registry.upsert_address("home", TransportKind::NetworkAdb, "R58M", "192.168.1.20:5555").unwrap();
        registry.upsert_address("office", TransportKind::NetworkAdb, "R58M", "10.0.0.7:5555").unwrap();

        forget(&ctx, "R58M", false).unwrap();
        assert_eq!(registry.networks().unwrap(), vec!["office".to_string()]);

        forget(&ctx, "R58M", true).unwrap();
        assert!(registry.networks().unwrap().is_empty());
    }

    #[test]
    fn test_describe_entry() {
        let host = ShellHost {
            user: "pi".into(),
            name: "nas".into(),
            ip: "192.168.1.5".into(),
            os: "linux".into(),
        };
        assert_eq!(describe_entry(&RegistryEntry::Shell(host)), "pi@192.168.1.5 (linux)");
        assert_eq!(
            describe_entry(&RegistryEntry::Address("10.0.0.2:5555".into())),
            "10.0.0.2:5555"
        );
    }
}
