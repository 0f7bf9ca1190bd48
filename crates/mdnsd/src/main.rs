// # mdnsd - Multicast DNS Responder Daemon
//
// This daemon is a thin integration layer. All protocol logic (probing,
// announcing, conflict handling, goodbyes) lives in mdns-core; the daemon:
// 1. Reads configuration from a JSON file and/or environment variables
// 2. Initializes logging and the runtime
// 3. Registers transports and creates the configured one
// 4. Registers the configured services and runs the responder until a
//    shutdown signal arrives
//
// ## Configuration
//
// A JSON file (`MDNS_CONFIG_FILE`) provides the base configuration; the
// environment variables below override it.
//
// - `MDNS_CONFIG_FILE`: Path to a JSON configuration file (optional)
// - `MDNS_HOSTNAME`: Host label advertised as `<hostname>.local.`
// - `MDNS_INTERFACES`: Comma-separated interface names (default: all)
// - `MDNS_PORT`: UDP port (default: 5353)
// - `MDNS_SERVICES`: Comma-separated services, `[Name@]_type._proto:port`
// - `MDNS_NO_AUTO_RENAME`: Fail services on conflict instead of renaming
// - `MDNS_LOG_LEVEL`: trace, debug, info, warn, error (default: info)
//
// ## Example
//
// ```bash
// export MDNS_HOSTNAME=printer
// export MDNS_INTERFACES=eth0
// export MDNS_SERVICES="Office Printer@_ipp._tcp:631,_http._tcp:80"
//
// mdnsd
// ```

use anyhow::{Context, Result};
use mdns_core::config::{ResponderConfig, ServiceConfig, TransportConfig};
use mdns_core::registry::TransportRegistry;
use mdns_core::transport::{MemoryNetwork, memory};
use mdns_core::{
    Capability, Client, Credentials, EngineEvent, Registration, RegistrationEvent,
    RegistrationEvents, Responder, ServiceSpec,
};
use std::env;
use std::process::ExitCode;
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Principal the daemon connects to its own responder as
const DAEMON_PRINCIPAL: &str = "mdnsd";

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum MdnsExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<MdnsExitCode> for ExitCode {
    fn from(code: MdnsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon settings: the responder configuration plus logging
struct Settings {
    responder: ResponderConfig,
    log_level: String,
}

impl Settings {
    /// Load the configuration file (if any) and apply environment overrides
    fn from_env() -> Result<Self> {
        let mut responder = match env::var("MDNS_CONFIG_FILE") {
            Ok(path) => ResponderConfig::from_json_file(&path)
                .with_context(|| format!("failed to load MDNS_CONFIG_FILE {}", path))?,
            Err(_) => {
                let mut config = ResponderConfig::new(default_hostname());
                config.transport = TransportConfig::Udp {
                    interfaces: Vec::new(),
                    port: mdns_core::wire::MDNS_PORT,
                };
                config
            }
        };

        if let Ok(hostname) = env::var("MDNS_HOSTNAME") {
            responder.hostname = hostname;
        }

        let interfaces = env::var("MDNS_INTERFACES").ok().map(|value| split_list(&value));
        let port = match env::var("MDNS_PORT") {
            Ok(value) => Some(
                value
                    .parse::<u16>()
                    .with_context(|| format!("MDNS_PORT '{}' is not a port number", value))?,
            ),
            Err(_) => None,
        };
        if interfaces.is_some() || port.is_some() {
            let (current_interfaces, current_port) = match &responder.transport {
                TransportConfig::Udp { interfaces, port } => (interfaces.clone(), *port),
                _ => (Vec::new(), mdns_core::wire::MDNS_PORT),
            };
            responder.transport = TransportConfig::Udp {
                interfaces: interfaces.unwrap_or(current_interfaces),
                port: port.unwrap_or(current_port),
            };
        }

        let no_auto_rename = env::var("MDNS_NO_AUTO_RENAME")
            .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if let Ok(value) = env::var("MDNS_SERVICES") {
            for entry in split_list(&value) {
                let mut service = parse_service(&entry)?;
                service.no_auto_rename = no_auto_rename;
                responder.services.push(service);
            }
        }

        Ok(Self {
            responder,
            log_level: env::var("MDNS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        self.responder
            .validate()
            .context("invalid responder configuration")?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "MDNS_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }
}

/// First label of the system hostname, or "mdnsd"
fn default_hostname() -> String {
    env::var("HOSTNAME")
        .ok()
        .and_then(|host| host.split('.').next().map(str::to_string))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| DAEMON_PRINCIPAL.to_string())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `[Name@]_type._proto:port`
fn parse_service(entry: &str) -> Result<ServiceConfig> {
    let (name, rest) = match entry.split_once('@') {
        Some((name, rest)) => (name.trim(), rest.trim()),
        None => ("", entry),
    };
    let (service_type, port) = rest
        .rsplit_once(':')
        .with_context(|| format!("service '{}' is missing ':port'", entry))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("service '{}' has an invalid port", entry))?;

    Ok(ServiceConfig::new(service_type, port).with_name(name))
}

fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return MdnsExitCode::ConfigError.into();
        }
    };

    if let Err(e) = settings.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return MdnsExitCode::ConfigError.into();
    }

    let log_level = match settings.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return MdnsExitCode::ConfigError.into();
    }

    info!("Starting mdnsd as {}.local.", settings.responder.hostname);
    info!(
        "Configuration loaded: {} service(s)",
        settings.responder.services.len()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return MdnsExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(settings.responder)).into()
}

/// Run the daemon until a shutdown signal arrives
async fn run_daemon(config: ResponderConfig) -> MdnsExitCode {
    let registry = TransportRegistry::new();

    #[cfg(feature = "udp")]
    {
        info!("Registering UDP transport");
        mdns_transport_udp::register(&registry);
    }
    // Dry run on a link nobody else shares
    memory::register(&registry, MemoryNetwork::new());

    let transport = match registry.create_transport(&config.transport) {
        Ok(transport) => transport,
        Err(e) => {
            error!(
                "Failed to create {} transport: {}",
                config.transport.type_name(),
                e
            );
            return MdnsExitCode::ConfigError;
        }
    };

    let access = config.access.build();
    let services = config.services.clone();
    let (responder, events) = match Responder::new(transport, access, config).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to start responder: {}", e);
            return MdnsExitCode::ConfigError;
        }
    };
    tokio::spawn(log_events(events));

    let credentials =
        Credentials::new(DAEMON_PRINCIPAL).with_capability(Capability::ServiceDiscovery);
    let client = match responder.connect(&credentials) {
        Ok(client) => client,
        Err(e) => {
            error!("Access policy refused the daemon: {}", e);
            return MdnsExitCode::ConfigError;
        }
    };

    let registrations = match register_services(&client, &services) {
        Ok(registrations) => registrations,
        Err(e) => {
            error!("Failed to register services: {:#}", e);
            return MdnsExitCode::ConfigError;
        }
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => error!("Shutdown signal error: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    let result = responder.run_with_shutdown(Some(shutdown_rx)).await;
    // Goodbyes already went out during shutdown
    drop(registrations);

    match result {
        Ok(()) => {
            info!("mdnsd stopped");
            MdnsExitCode::CleanShutdown
        }
        Err(e) => {
            error!("Responder error: {}", e);
            MdnsExitCode::RuntimeError
        }
    }
}

/// Register every configured service, logging each outcome as it arrives
fn register_services(client: &Client, services: &[ServiceConfig]) -> Result<Vec<Registration>> {
    let mut registrations = Vec::with_capacity(services.len());
    for service in services {
        let (registration, listener) = client
            .register_service(ServiceSpec::from(service))
            .with_context(|| format!("service {} on port {}", service.service_type, service.port))?;
        info!("Registering {}", registration.name());
        tokio::spawn(log_outcomes(listener));
        registrations.push(registration);
    }
    Ok(registrations)
}

async fn log_outcomes(mut listener: RegistrationEvents) {
    while let Some(event) = listener.recv().await {
        match event {
            RegistrationEvent::Registered { name, .. } => info!("Advertising {}", name),
            RegistrationEvent::Conflict { name, .. } => {
                warn!("{} is in use on the network; not advertising it", name)
            }
            RegistrationEvent::Failed { code, message, .. } => {
                error!("Registration failed ({}): {}", code, message)
            }
        }
    }
}

async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Renamed { from, to, .. } => info!("Renamed {} to {}", from, to),
            EngineEvent::HostRenamed { from, to } => {
                warn!("Host name {} is taken, now {}", from, to)
            }
            EngineEvent::SendFailed { interface, error } => {
                warn!("Send on {} failed: {}", interface, error)
            }
            EngineEvent::InterfaceUp { index } => info!("Interface {} is up", index),
            EngineEvent::InterfaceDown { index } => info!("Interface {} is down", index),
            other => tracing::debug!("{:?}", other),
        }
    }
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for Ctrl-C
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for CTRL-C")?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_with_name() {
        let service = parse_service("Office Printer@_ipp._tcp:631").unwrap();
        assert_eq!(service.name, "Office Printer");
        assert_eq!(service.service_type, "_ipp._tcp");
        assert_eq!(service.port, 631);
        assert_eq!(service.domain, "local.");
    }

    #[test]
    fn test_parse_service_without_name() {
        let service = parse_service("_http._tcp:8080").unwrap();
        assert!(service.name.is_empty());
        assert_eq!(service.port, 8080);
    }

    #[test]
    fn test_parse_service_rejects_bad_port() {
        assert!(parse_service("_http._tcp").is_err());
        assert!(parse_service("_http._tcp:http").is_err());
        assert!(parse_service("_http._tcp:70000").is_err());
    }

    #[test]
    fn test_split_list_skips_blanks() {
        assert_eq!(split_list(" eth0, ,wlan0 "), vec!["eth0", "wlan0"]);
    }
}
