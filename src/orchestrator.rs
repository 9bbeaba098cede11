//! # Connection Orchestrator
//!
//! Establishes a session to every reachable device. USB-attached devices are
//! handshaken first; each one gets its network channel switched on and, when
//! it reports an address, a secondary network session. Devices without USB
//! are then reached through the addresses the registry remembers for the
//! current network.
//!
//! Handshake failures follow a fixed recovery policy:
//!
//! | Failure        | Recovery                                              |
//! |----------------|-------------------------------------------------------|
//! | `Unavailable`  | skipped silently                                      |
//! | `Busy`         | competing driver killed, one retry after settle delay |
//! | `AuthPending`  | user prompted to accept the trust dialog, retried     |
//! | `Unclassified` | reported, attempt abandoned                           |
//!
//! A failure never aborts the run; it only leaves that device without a session.

use crate::output;
use crate::registry::DeviceRegistry;
use crate::transport::{
    Credential, DeviceIdentity, Endpoint, FailureKind, Transport, TransportError, TransportKind,
};
use anyhow::{Result, bail};
use std::collections::HashSet;
use std::fmt;
use std::io::BufRead;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{Level, debug, info, span, warn};

/// Host-side operations of the device bridge driver
pub trait Bridge {
    /// Serials of USB-attached devices
    ///
    /// # Errors
    ///
    /// Returns an error if the driver cannot be queried.
    fn usb_devices(&self) -> Result<Vec<String>>;

    /// Handshake with an endpoint, bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns a classified [`TransportError`] on failure.
    fn open(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;

    /// Switch on the device's network control channel
    ///
    /// # Errors
    ///
    /// Returns an error if the device refuses.
    fn enable_network(&self, serial: &str, port: u16) -> Result<()>;

    /// Restart the local driver
    ///
    /// # Errors
    ///
    /// Returns an error if the driver cannot be run at all.
    fn restart_driver(&self) -> Result<()>;

    /// Terminate a competing local driver holding the USB interface
    ///
    /// # Errors
    ///
    /// Returns an error if the driver cannot be run at all.
    fn kill_competing_driver(&self) -> Result<()>;
}

/// Opens sessions to shell-reachable hosts
pub trait ShellDialer {
    /// Connect to `user@host`
    ///
    /// # Errors
    ///
    /// Returns a classified [`TransportError`] on failure.
    fn dial(
        &self,
        user: &str,
        host: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Waits for the user to accept a device's trust dialog
pub trait TrustPrompt {
    /// Block until the user confirms
    ///
    /// # Errors
    ///
    /// Returns an error when no confirmation can be obtained; the attempt is
    /// then abandoned.
    fn wait_for_trust(&self, device: &str) -> Result<()>;
}

/// Prompts on the terminal and waits for Enter
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl TrustPrompt for StdinPrompt {
    fn wait_for_trust(&self, device: &str) -> Result<()> {
        output::warning(&format!(
            "Device {device} is waiting for authorization. \
             Unlock it, accept the debugging prompt, then press Enter."
        ));
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            bail!("Input closed while waiting for {device} to be authorized");
        }
        Ok(())
    }
}

/// Refuses to wait; used when no terminal is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractivePrompt;

impl TrustPrompt for NonInteractivePrompt {
    fn wait_for_trust(&self, device: &str) -> Result<()> {
        bail!("Device {device} is waiting for authorization; accept the prompt on the device and run again")
    }
}

/// State of one device attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Handshake in progress
    Authenticating,
    /// Session established
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Open sessions to one device
pub enum Sessions {
    /// USB-attached, optionally also reachable over the network
    Wired {
        /// Primary USB session
        usb: Box<dyn Transport>,
        /// Secondary network session
        network: Option<Box<dyn Transport>>,
    },
    /// Reached over the network bridge only
    Wireless(Box<dyn Transport>),
    /// Reached over a remote shell
    Shell(Box<dyn Transport>),
}

impl Sessions {
    /// Session commands should go through; wired wins over wireless
    #[must_use]
    pub fn active(&self) -> &dyn Transport {
        match self {
            Self::Wired { usb, .. } => usb.as_ref(),
            Self::Wireless(session) | Self::Shell(session) => session.as_ref(),
        }
    }

    /// Secondary session, if any
    #[must_use]
    pub fn secondary(&self) -> Option<&dyn Transport> {
        match self {
            Self::Wired { network, .. } => network.as_deref(),
            Self::Wireless(_) | Self::Shell(_) => None,
        }
    }

    /// Close every open session, logging failures
    fn close_all(&mut self) {
        let sessions: Vec<&mut Box<dyn Transport>> = match self {
            Self::Wired { usb, network } => std::iter::once(usb).chain(network.as_mut()).collect(),
            Self::Wireless(session) | Self::Shell(session) => vec![session],
        };
        for session in sessions {
            if let Err(e) = session.close() {
                warn!(session = %session.id(), error = %e, "Failed to close session");
            }
        }
    }
}

/// A connected device
pub struct DeviceConnection {
    /// Who the device is
    pub identity: DeviceIdentity,
    /// How it is reached
    pub sessions: Sessions,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("identity", &self.identity)
            .field("active", &self.sessions.active().id())
            .finish()
    }
}

/// Close every session of every connection
pub fn disconnect_all(connections: Vec<DeviceConnection>) {
    for mut connection in connections {
        connection.sessions.close_all();
        trace_state(&connection.identity.id, ConnectionState::Disconnected);
    }
}

/// Tunables of the connection procedure
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Bound on one handshake
    pub auth_timeout: Duration,
    /// Wait after restarting or killing the driver
    pub settle_delay: Duration,
    /// Port requested when enabling the network channel
    pub tcp_port: u16,
    /// Device interface whose address is recorded
    pub network_interface: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(3000),
            tcp_port: 5555,
            network_interface: "wlan0".to_string(),
        }
    }
}

fn trace_state(device: &str, state: ConnectionState) {
    debug!(%device, %state, "Connection state");
}

/// Drives handshakes for every reachable device
pub struct ConnectionOrchestrator<'a, B: Bridge, D: ShellDialer> {
    bridge: B,
    dialer: D,
    prompt: &'a dyn TrustPrompt,
    registry: &'a DeviceRegistry,
    /// Current network identity; `None` disables registry use
    network: Option<String>,
    settings: OrchestratorSettings,
}

impl<'a, B: Bridge, D: ShellDialer> ConnectionOrchestrator<'a, B, D> {
    /// Orchestrator over the given collaborators
    pub fn new(
        bridge: B,
        dialer: D,
        prompt: &'a dyn TrustPrompt,
        registry: &'a DeviceRegistry,
        network: Option<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            bridge,
            dialer,
            prompt,
            registry,
            network,
            settings,
        }
    }

    /// Connect every reachable device
    ///
    /// USB-attached devices come first, followed by registry reconnects.
    pub fn connect(&self, credential: &Credential) -> Vec<DeviceConnection> {
        let span = span!(Level::INFO, "connect", network = ?self.network);
        let _guard = span.enter();

        let mut connections = Vec::new();
        let serials = self.bridge.usb_devices().unwrap_or_else(|e| {
            warn!(error = %e, "Could not list USB devices");
            Vec::new()
        });
        for serial in serials {
            if let Some(connection) = self.connect_usb(&serial, credential) {
                connections.push(connection);
            }
        }

        self.reconnect_known(credential, &mut connections);
        info!(devices = connections.len(), "Connection pass finished");
        connections
    }

    /// Handshake with retry and recovery according to the failure kind
    fn handshake(&self, endpoint: &Endpoint, credential: &Credential) -> Option<Box<dyn Transport>> {
        let device = endpoint.target();
        let mut busy_retried = false;

        loop {
            trace_state(&device, ConnectionState::Authenticating);
            let error = match self.bridge.open(endpoint, credential, self.settings.auth_timeout) {
                Ok(session) => {
                    trace_state(&device, ConnectionState::Connected);
                    return Some(session);
                }
                Err(e) => e,
            };
            trace_state(&device, ConnectionState::Disconnected);

            match error.kind {
                FailureKind::Unavailable => {
                    debug!(%device, error = %error, "Nothing to connect to");
                    return None;
                }
                FailureKind::Busy if !busy_retried => {
                    busy_retried = true;
                    info!(%device, "Device busy; stopping competing driver");
                    if let Err(e) = self.bridge.kill_competing_driver() {
                        warn!(error = %e, "Failed to stop competing driver");
                    }
                    std::thread::sleep(self.settings.settle_delay);
                }
                FailureKind::AuthPending => {
                    if let Err(e) = self.prompt.wait_for_trust(&device) {
                        output::warning(&format!("Skipping {device}: {e}"));
                        return None;
                    }
                }
                FailureKind::Busy | FailureKind::Unclassified => {
                    output::warning(&error.user_message());
                    warn!(%device, error = %error, kind = error.error_type(), "Giving up on device");
                    return None;
                }
            }
        }
    }

    /// Primary USB session plus secondary network session for one device
    fn connect_usb(&self, serial: &str, credential: &Credential) -> Option<DeviceConnection> {
        let span = span!(Level::DEBUG, "usb_device", %serial);
        let _guard = span.enter();

        let endpoint = Endpoint::Usb(serial.to_string());
        let mut usb = self.handshake(&endpoint, credential)?;

        let port = match network_port(usb.as_ref()) {
            Some(port) => port,
            None => {
                info!(%serial, port = self.settings.tcp_port, "Enabling network channel");
                if let Err(e) = self.bridge.enable_network(serial, self.settings.tcp_port) {
                    warn!(%serial, error = %e, "Could not enable network channel");
                } else {
                    if let Err(e) = self.bridge.restart_driver() {
                        warn!(error = %e, "Failed to restart driver");
                    }
                    std::thread::sleep(self.settings.settle_delay);
                    usb = self.handshake(&endpoint, credential)?;
                }
                self.settings.tcp_port
            }
        };

        let mut identity = match query_identity(
            usb.as_ref(),
            TransportKind::Usb,
            &self.settings.network_interface,
            port,
        ) {
            Ok(identity) => identity,
            Err(e) => {
                output::warning(&format!("Could not identify {serial}: {e:#}"));
                if let Err(e) = usb.close() {
                    warn!(error = %e, "Failed to close session");
                }
                return None;
            }
        };
        // The bridge addresses the device by serial even if the property is empty.
        // Such an id cannot be confirmed over the network, so it is not recorded.
        let reported = !identity.id.is_empty();
        if !reported {
            debug!(%serial, "Device reports no serial; using the bridge serial");
            identity.id = serial.to_string();
        }

        let network = identity
            .current_address
            .as_deref()
            .and_then(|addr| addr.parse::<SocketAddr>().ok())
            .and_then(|addr| {
                match self
                    .bridge
                    .open(&Endpoint::Network(addr), credential, self.settings.auth_timeout)
                {
                    Ok(session) => Some(session),
                    Err(e) => {
                        warn!(%addr, error = %e, "Secondary network session failed");
                        None
                    }
                }
            });

        if reported
            && let (Some(network_id), Some(address)) = (&self.network, &identity.current_address)
            && let Err(e) = self.registry.upsert_address(
                network_id,
                TransportKind::NetworkAdb,
                &identity.id,
                address,
            )
        {
            warn!(error = %e, "Failed to update device registry");
        }

        output::action("Connected", &format!("{} (usb)", identity.id));
        Some(DeviceConnection {
            identity,
            sessions: Sessions::Wired { usb, network },
        })
    }

    /// Reach registry entries of the current network that are not connected yet
    fn reconnect_known(&self, credential: &Credential, connections: &mut Vec<DeviceConnection>) {
        let Some(network) = &self.network else {
            debug!("No network identity; skipping registry reconnects");
            return;
        };
        let mut connected: HashSet<String> =
            connections.iter().map(|c| c.identity.id.clone()).collect();

        let addresses = self
            .registry
            .addresses(network, TransportKind::NetworkAdb)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Could not read device registry");
                Vec::new()
            });
        for (id, address) in addresses {
            if connected.contains(&id) {
                continue;
            }
            let Ok(addr) = address.parse::<SocketAddr>() else {
                warn!(device = %id, %address, "Ignoring malformed registry address");
                continue;
            };
            let Some(session) = self.handshake(&Endpoint::Network(addr), credential) else {
                continue;
            };
            if let Some(connection) = self.accept(
                &id,
                session,
                TransportKind::NetworkAdb,
                |session| query_identity(session, TransportKind::NetworkAdb, &self.settings.network_interface, addr.port()),
                Sessions::Wireless,
            ) {
                connected.insert(id);
                connections.push(connection);
            }
        }

        let hosts = self.registry.shell_hosts(network).unwrap_or_else(|e| {
            warn!(error = %e, "Could not read device registry");
            Vec::new()
        });
        for (id, host) in hosts {
            if connected.contains(&id) {
                continue;
            }
            trace_state(&id, ConnectionState::Authenticating);
            let session =
                match self
                    .dialer
                    .dial(&host.user, &host.ip, credential, self.settings.auth_timeout)
                {
                    Ok(session) => session,
                    Err(e) => {
                        trace_state(&id, ConnectionState::Disconnected);
                        if e.kind != FailureKind::Unavailable {
                            warn!(device = %id, error = %e, "Shell host unreachable");
                        }
                        continue;
                    }
                };
            if let Some(connection) = self.accept(
                &id,
                session,
                TransportKind::Shell,
                |session| shell_identity(session, &host.ip, &host.os),
                Sessions::Shell,
            ) {
                connected.insert(id);
                connections.push(connection);
            }
        }
    }

    /// Keep a reconnected session only if it answers as the expected device
    fn accept(
        &self,
        expected: &str,
        mut session: Box<dyn Transport>,
        kind: TransportKind,
        identify: impl FnOnce(&dyn Transport) -> Result<DeviceIdentity>,
        wrap: fn(Box<dyn Transport>) -> Sessions,
    ) -> Option<DeviceConnection> {
        match identify(session.as_ref()) {
            Ok(identity) if identity.id == expected => {
                output::action("Connected", &format!("{} ({kind})", identity.id));
                Some(DeviceConnection {
                    identity,
                    sessions: wrap(session),
                })
            }
            Ok(identity) => {
                warn!(expected, found = %identity.id, at = %session.id(), "Address now belongs to another device");
                if let Err(e) = session.close() {
                    warn!(error = %e, "Failed to close session");
                }
                None
            }
            Err(e) => {
                warn!(device = expected, error = %e, "Could not identify reconnected device");
                if let Err(e) = session.close() {
                    warn!(error = %e, "Failed to close session");
                }
                None
            }
        }
    }
}

/// Port the network control channel listens on, if enabled
fn network_port(session: &dyn Transport) -> Option<u16> {
    session
        .execute("getprop service.adb.tcp.port")
        .ok()
        .and_then(|out| out.trim().parse::<u16>().ok())
        .filter(|port| *port > 0)
}

/// IPv4 address from `ip -o -4 addr show` output
#[must_use]
pub fn parse_interface_address(output: &str) -> Option<String> {
    let mut fields = output.split_whitespace();
    fields.find(|f| *f == "inet")?;
    let cidr = fields.next()?;
    let ip = cidr.split('/').next()?;
    ip.parse::<std::net::Ipv4Addr>().ok().map(|ip| ip.to_string())
}

/// Identify a device reached over the bridge
///
/// # Errors
///
/// Returns an error if the identity queries cannot be run.
pub fn query_identity(
    session: &dyn Transport,
    kind: TransportKind,
    interface: &str,
    port: u16,
) -> Result<DeviceIdentity> {
    let id = session.execute("getprop ro.serialno")?.trim().to_string();
    let release = session.execute("getprop ro.build.version.release")?;
    let addresses = session.execute(&format!(
        "ip -o -4 addr show {}",
        crate::transport::quote(interface)
    ))?;
    let current_address = parse_interface_address(&addresses).map(|ip| format!("{ip}:{port}"));

    Ok(DeviceIdentity {
        id,
        current_address,
        transport_kind: kind,
        operating_system: format!("Android {}", release.trim()),
    })
}

/// Identify a shell host by its host name
///
/// # Errors
///
/// Returns an error if `hostname` cannot be run or prints nothing.
pub fn shell_identity(session: &dyn Transport, ip: &str, os: &str) -> Result<DeviceIdentity> {
    let id = session.execute("hostname")?.trim().to_string();
    if id.is_empty() {
        bail!("{} reported no host name", session.id());
    }
    Ok(DeviceIdentity {
        id,
        current_address: Some(ip.to_string()),
        transport_kind: TransportKind::Shell,
        operating_system: os.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ShellHost;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};
    use tempfile::TempDir;

    /// Device reachable through the fake bridge
    struct FakeDevice {
        serial: String,
        tcp_port: String,
        address: Option<String>,
        /// Whether `ro.serialno` is filled in
        reports_serial: bool,
    }

    impl Transport for FakeDevice {
        fn id(&self) -> &str {
            &self.serial
        }

        fn execute(&self, command: &str) -> Result<String> {
            Ok(match command {
                "getprop ro.serialno" if self.reports_serial => format!("{}\n", self.serial),
                "getprop ro.serialno" => "\n".to_string(),
                "getprop ro.build.version.release" => "14\n".to_string(),
                "getprop service.adb.tcp.port" => format!("{}\n", self.tcp_port),
                "hostname" => format!("{}\n", self.serial),
                c if c.starts_with("ip -o -4 addr show") => match &self.address {
                    Some(ip) => format!("47: wlan0    inet {ip}/24 brd 192.168.1.255 scope global wlan0\n"),
                    None => String::new(),
                },
                _ => String::new(),
            })
        }

        fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn write_file(&self, _path: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBridge {
        usb: Vec<String>,
        /// Scripted failures per endpoint target, consumed in order
        failures: RefCell<HashMap<String, VecDeque<FailureKind>>>,
        /// Serial answering at each network address
        network: HashMap<String, String>,
        tcp_enabled: bool,
        /// Devices leave `ro.serialno` empty
        blank_serial: bool,
        opens: Cell<usize>,
        kills: Cell<usize>,
        enabled: Cell<usize>,
    }

    impl FakeBridge {
        fn fail(&self, target: &str, kinds: &[FailureKind]) {
            self.failures
                .borrow_mut()
                .insert(target.to_string(), kinds.iter().copied().collect());
        }
    }

    impl Bridge for FakeBridge {
        fn usb_devices(&self) -> Result<Vec<String>> {
            Ok(self.usb.clone())
        }

        fn open(
            &self,
            endpoint: &Endpoint,
            _credential: &Credential,
            _timeout: Duration,
        ) -> Result<Box<dyn Transport>, TransportError> {
            self.opens.set(self.opens.get() + 1);
            let target = endpoint.target();
            if let Some(kind) = self
                .failures
                .borrow_mut()
                .get_mut(&target)
                .and_then(VecDeque::pop_front)
            {
                return Err(TransportError::new(kind, "scripted"));
            }
            let serial = match endpoint {
                Endpoint::Usb(serial) => serial.clone(),
                Endpoint::Network(_) => match self.network.get(&target) {
                    Some(serial) => serial.clone(),
                    None => return Err(TransportError::new(FailureKind::Unavailable, "no route")),
                },
            };
            Ok(Box::new(FakeDevice {
                serial,
                tcp_port: (if self.tcp_enabled || self.enabled.get() > 0 { "5555" } else { "" })
                    .to_string(),
                address: Some("192.168.1.20".to_string()),
                reports_serial: !self.blank_serial,
            }))
        }

        fn enable_network(&self, _serial: &str, _port: u16) -> Result<()> {
            self.enabled.set(self.enabled.get() + 1);
            Ok(())
        }

        fn restart_driver(&self) -> Result<()> {
            Ok(())
        }

        fn kill_competing_driver(&self) -> Result<()> {
            self.kills.set(self.kills.get() + 1);
            Ok(())
        }
    }

    struct FakeDialer;

    impl ShellDialer for FakeDialer {
        fn dial(
            &self,
            _user: &str,
            host: &str,
            _credential: &Credential,
            _timeout: Duration,
        ) -> Result<Box<dyn Transport>, TransportError> {
            // The host at .5 calls itself "nas"; anything else is down
            if host == "192.168.1.5" {
                Ok(Box::new(FakeDevice {
                    serial: "nas".into(),
                    tcp_port: String::new(),
                    address: None,
                    reports_serial: true,
                }))
            } else {
                Err(TransportError::new(FailureKind::Unavailable, "no route"))
            }
        }
    }

    /// Prompt that approves a fixed number of times
    struct CountingPrompt {
        calls: Cell<usize>,
    }

    impl TrustPrompt for CountingPrompt {
        fn wait_for_trust(&self, _device: &str) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        registry: DeviceRegistry,
        credential: Credential,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let key = temp.path().join("adbkey");
        std::fs::write(&key, "key").unwrap();
        Fixture {
            registry: DeviceRegistry::open(&temp.path().join("devices.json"), temp.path()),
            credential: Credential::load(&key).unwrap(),
            _temp: temp,
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            settle_delay: Duration::ZERO,
            ..OrchestratorSettings::default()
        }
    }

    #[test]
    fn test_busy_retries_exactly_once() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["R58M".into()],
            tcp_enabled: true,
            ..FakeBridge::default()
        };
        bridge.fail("R58M", &[FailureKind::Busy, FailureKind::Busy, FailureKind::Busy]);
        let prompt = NonInteractivePrompt;
        let orchestrator = ConnectionOrchestrator::new(
            bridge,
            FakeDialer,
            &prompt,
            &fx.registry,
            None,
            settings(),
        );

        let connections = orchestrator.connect(&fx.credential);
        assert!(connections.is_empty());
        assert_eq!(orchestrator.bridge.opens.get(), 2);
        assert_eq!(orchestrator.bridge.kills.get(), 1);
    }

    #[test]
    fn test_busy_then_success() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["R58M".into()],
            tcp_enabled: true,
            ..FakeBridge::default()
        };
        bridge.fail("R58M", &[FailureKind::Busy]);
        let prompt = NonInteractivePrompt;
        let orchestrator =
            ConnectionOrchestrator::new(bridge, FakeDialer, &prompt, &fx.registry, None, settings());

        let connections = orchestrator.connect(&fx.credential);
        assert_eq!(connections.len(), 1);
        disconnect_all(connections);
    }

    #[test]
    fn test_auth_pending_prompts_until_accepted() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["R58M".into()],
            tcp_enabled: true,
            ..FakeBridge::default()
        };
        bridge.fail(
            "R58M",
            &[FailureKind::AuthPending, FailureKind::AuthPending, FailureKind::AuthPending],
        );
        let prompt = CountingPrompt { calls: Cell::new(0) };
        let orchestrator =
            ConnectionOrchestrator::new(bridge, FakeDialer, &prompt, &fx.registry, None, settings());

        let connections = orchestrator.connect(&fx.credential);
        assert_eq!(connections.len(), 1);
        assert_eq!(prompt.calls.get(), 3);
    }

    #[test]
    fn test_auth_pending_non_interactive_gives_up() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["R58M".into()],
            ..FakeBridge::default()
        };
        bridge.fail("R58M", &[FailureKind::AuthPending]);
        let prompt = NonInteractivePrompt;
        let orchestrator =
            ConnectionOrchestrator::new(bridge, FakeDialer, &prompt, &fx.registry, None, settings());

        assert!(orchestrator.connect(&fx.credential).is_empty());
        assert_eq!(orchestrator.bridge.opens.get(), 1);
    }

    #[test]
    fn test_unavailable_and_unclassified_do_not_block_others() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["GONE".into(), "BROKEN".into(), "R58M".into()],
            tcp_enabled: true,
            ..FakeBridge::default()
        };
        bridge.fail("GONE", &[FailureKind::Unavailable]);
        bridge.fail("BROKEN", &[FailureKind::Unclassified]);
        let prompt = NonInteractivePrompt;
        let orchestrator =
            ConnectionOrchestrator::new(bridge, FakeDialer, &prompt, &fx.registry, None, settings());

        let connections = orchestrator.connect(&fx.credential);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].identity.id, "R58M");
    }

    #[test]
    fn test_usb_connect_enables_network_and_records_address() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["R58M".into()],
            network: HashMap::from([("192.168.1.20:5555".to_string(), "R58M".to_string())]),
            ..FakeBridge::default()
        };
        fx.registry
            .upsert_address("gw", TransportKind::NetworkAdb, "OTHER", "192.168.1.99:5555")
            .unwrap();
        let prompt = NonInteractivePrompt;
        let orchestrator = ConnectionOrchestrator::new(
            bridge,
            FakeDialer,
            &prompt,
            &fx.registry,
            Some("gw".into()),
            settings(),
        );

        let connections = orchestrator.connect(&fx.credential);
        assert_eq!(orchestrator.bridge.enabled.get(), 1);
        assert_eq!(connections.len(), 1);

        let connection = &connections[0];
        assert_eq!(connection.identity.id, "R58M");
        assert_eq!(connection.identity.operating_system, "Android 14");
        assert_eq!(connection.identity.current_address.as_deref(), Some("192.168.1.20:5555"));
        assert!(connection.sessions.secondary().is_some());
        assert_eq!(connection.sessions.active().id(), "R58M");

        let mut addresses = fx.registry.addresses("gw", TransportKind::NetworkAdb).unwrap();
        addresses.sort();
        assert_eq!(
            addresses,
            vec![
                ("OTHER".to_string(), "192.168.1.99:5555".to_string()),
                ("R58M".to_string(), "192.168.1.20:5555".to_string()),
            ]
        );
    }

    #[test]
    fn test_blank_serial_uses_bridge_serial_without_recording() {
        let fx = fixture();
        let bridge = FakeBridge {
            usb: vec!["R58M".into()],
            tcp_enabled: true,
            blank_serial: true,
            ..FakeBridge::default()
        };
        let prompt = NonInteractivePrompt;
        let orchestrator = ConnectionOrchestrator::new(
            bridge,
            FakeDialer,
            &prompt,
            &fx.registry,
            Some("gw".into()),
            settings(),
        );

        let connections = orchestrator.connect(&fx.credential);
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].identity.id, "R58M");
        // A reconnect could never match this id, so it stays out of the registry
        assert!(fx.registry.addresses("gw", TransportKind::NetworkAdb).unwrap().is_empty());
    }

    #[test]
    fn test_reconnect_accepts_only_matching_ids() {
        let fx = fixture();
        fx.registry
            .upsert_address("gw", TransportKind::NetworkAdb, "TABLET", "192.168.1.30:5555")
            .unwrap();
        fx.registry
            .upsert_address("gw", TransportKind::NetworkAdb, "PHONE", "192.168.1.31:5555")
            .unwrap();
        fx.registry
            .upsert_shell_host(
                "gw",
                "nas",
                ShellHost {
                    user: "pi".into(),
                    name: "nas".into(),
                    ip: "192.168.1.5".into(),
                    os: "linux".into(),
                },
            )
            .unwrap();
        let bridge = FakeBridge {
            network: HashMap::from([
                ("192.168.1.30:5555".to_string(), "TABLET".to_string()),
                // Address reassigned to a different device
                ("192.168.1.31:5555".to_string(), "STRANGER".to_string()),
            ]),
            ..FakeBridge::default()
        };
        let prompt = NonInteractivePrompt;
        let orchestrator = ConnectionOrchestrator::new(
            bridge,
            FakeDialer,
            &prompt,
            &fx.registry,
            Some("gw".into()),
            settings(),
        );

        let connections = orchestrator.connect(&fx.credential);
        let ids: Vec<_> = connections.iter().map(|c| c.identity.id.as_str()).collect();
        assert_eq!(ids, vec!["TABLET", "nas"]);
        assert!(matches!(connections[0].sessions, Sessions::Wireless(_)));
        assert!(matches!(connections[1].sessions, Sessions::Shell(_)));
    }

    #[test]
    fn test_parse_interface_address() {
        assert_eq!(
            parse_interface_address("47: wlan0    inet 192.168.1.20/24 brd 192.168.1.255 scope global wlan0"),
            Some("192.168.1.20".to_string())
        );
        assert_eq!(parse_interface_address(""), None);
    }
}
