//! siptun CLI - SIP/RTP tunnel manager
//!
//! Runs the tunnel manager against a TOML configuration, probes UDP mirrors,
//! and edits the provisioned server list.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use siptun_client::{
    CoreHost, SipPath, TomlConfigStore, TunnelConfig, TunnelManager, TunnelMode, TunnelState,
};
use siptun_proto::{format_server_list, ServerEntry};
use siptun_transport::{ClientCertificate, ProbeTarget, UdpMirrorProbe};
use siptun_transport_tls::TlsLinkConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// siptun - Tunnel SIP signaling and RTP media through TLS
#[derive(Parser, Debug)]
#[command(name = "siptun")]
#[command(about = "siptun - Tunnel SIP signaling and RTP media through TLS")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = "SIPTUN_CONFIG", default_value = "siptun.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel manager until interrupted
    #[command(long_about = r#"
Load the [tunnel] section of the configuration file and run the tunnel
manager until Ctrl+C. Command line options override the file.

EXAMPLES:
  # Decide automatically whether the tunnel is needed
  siptun run --mode auto --server tunnel.example.org:443:12345:1000

  # Force the tunnel through an HTTP proxy
  siptun run --mode enable --http-proxy proxy.local:3128
"#)]
    Run {
        /// Tunnel mode: disable, enable or auto
        #[arg(long)]
        mode: Option<TunnelMode>,

        /// Server entry (host:port[:mirror:delay][/host2:port2]), repeatable
        #[arg(long = "server")]
        servers: Vec<ServerEntry>,

        /// Use separate send and receive links
        #[arg(long)]
        dual_mode: bool,

        /// HTTP proxy as host:port
        #[arg(long)]
        http_proxy: Option<String>,

        /// Verify the tunnel server certificate
        #[arg(long)]
        verify_cert: bool,

        /// Trusted root certificates (PEM) used with --verify-cert
        #[arg(long)]
        root_ca: Option<PathBuf>,

        /// Client certificate chain (PEM)
        #[arg(long, requires = "client_key")]
        client_cert: Option<PathBuf>,

        /// Client private key (PEM)
        #[arg(long, requires = "client_cert")]
        client_key: Option<PathBuf>,

        /// Treat every UDP mirror probe as failed
        #[arg(long)]
        simulate_udp_loss: bool,

        /// Pump interval in milliseconds
        #[arg(long, default_value = "50")]
        tick_ms: u64,

        /// Write the effective configuration back on exit
        #[arg(long)]
        save: bool,
    },

    /// Probe the UDP mirror of each entry
    Probe {
        /// Entries to probe; defaults to the configured servers
        entries: Vec<ServerEntry>,
    },

    /// Manage the provisioned server list
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Print the configured entries
    List,
    /// Append an entry
    Add { entry: ServerEntry },
    /// Remove an entry
    Remove { entry: ServerEntry },
    /// Remove every entry
    Clear,
}

/// Host used when the manager runs standalone: no SIP stack to drive
struct StandaloneHost {
    root_ca: Option<PathBuf>,
}

impl CoreHost for StandaloneHost {
    fn is_network_reachable(&self) -> bool {
        true
    }

    fn register(&self) {
        info!("SIP register");
    }

    fn unregister(&self) {
        info!("SIP unregister");
    }

    fn apply_sip_transports(&self, path: SipPath) {
        match path {
            SipPath::Direct => info!("SIP transports: direct"),
            SipPath::Tunnel(transport) => {
                info!("SIP transports: tunnel (virtual port {})", transport.port())
            }
        }
    }

    fn root_ca(&self) -> Option<PathBuf> {
        self.root_ca.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            mode,
            servers,
            dual_mode,
            http_proxy,
            verify_cert,
            root_ca,
            client_cert,
            client_key,
            simulate_udp_loss,
            tick_ms,
            save,
        } => {
            let mut store = open_store(&cli.config)?;
            let mut config = TunnelConfig::load(&store);

            if let Some(mode) = mode {
                config.mode = mode;
            }
            if !servers.is_empty() {
                config.servers = servers;
            }
            if dual_mode {
                config.dual_mode = true;
            }
            if verify_cert {
                config.verify_cert = true;
            }
            if let Some(proxy) = http_proxy {
                let (host, port) = parse_host_port(&proxy)?;
                config.http_proxy_host = Some(host);
                config.http_proxy_port = port;
            }

            let host = Arc::new(StandaloneHost { root_ca });
            let mut manager = TunnelManager::with_tls(
                host,
                tokio::runtime::Handle::current(),
                TlsLinkConfig::default(),
            )
            .context("Invalid link configuration")?;

            if let (Some(cert), Some(key)) = (client_cert, client_key) {
                let certificate = ClientCertificate::from_pem_files(&cert, &key)
                    .context("Failed to load client certificate")?;
                manager.set_client_certificate(Some(certificate));
            }
            manager.simulate_udp_loss(simulate_udp_loss);
            manager.configure(&config);

            info!(
                "Tunnel manager running (mode {}, {} server(s)), press Ctrl+C to stop",
                manager.get_mode(),
                manager.servers().len()
            );
            pump(&mut manager, Duration::from_millis(tick_ms.max(1))).await;

            if save {
                manager.config_snapshot().save(&mut store);
                store.save().context("Failed to save configuration")?;
                info!("Configuration saved to {}", store.path().display());
            }
            Ok(())
        }

        Commands::Probe { entries } => {
            let entries = if entries.is_empty() {
                TunnelConfig::load(&open_store(&cli.config)?).servers
            } else {
                entries
            };
            probe_entries(&entries).await
        }

        Commands::Servers { action } => {
            let mut store = open_store(&cli.config)?;
            let mut config = TunnelConfig::load(&store);

            if apply_server_action(&mut config.servers, &action)? {
                config.save(&mut store);
                store.save().context("Failed to save configuration")?;
            }
            if let ServerAction::List = action {
                for entry in &config.servers {
                    println!("{}", entry);
                }
            }
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn open_store(path: &Path) -> Result<TomlConfigStore> {
    TomlConfigStore::open(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn parse_host_port(value: &str) -> Result<(String, u16)> {
    let Some((host, port)) = value.rsplit_once(':') else {
        bail!("Expected host:port, got '{}'", value);
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in '{}'", value))?;
    if host.is_empty() || port == 0 {
        bail!("Expected host:port, got '{}'", value);
    }
    Ok((host.to_string(), port))
}

/// Returns `true` when the list changed
fn apply_server_action(servers: &mut Vec<ServerEntry>, action: &ServerAction) -> Result<bool> {
    match action {
        ServerAction::List => Ok(false),
        ServerAction::Add { entry } => {
            servers.push(entry.clone());
            info!("Added {}", entry);
            Ok(true)
        }
        ServerAction::Remove { entry } => {
            let Some(index) = servers.iter().position(|e| e == entry) else {
                bail!("{} is not configured", entry);
            };
            servers.remove(index);
            info!("Removed {}", entry);
            Ok(true)
        }
        ServerAction::Clear => {
            servers.clear();
            Ok(true)
        }
    }
}

/// Drive the manager until Ctrl+C, logging state transitions
async fn pump(manager: &mut TunnelManager, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    let mut last = (manager.actual_state(), manager.is_connected());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                manager.on_iterate();
                let current = (manager.actual_state(), manager.is_connected());
                if current != last {
                    match current {
                        (TunnelState::On, true) => info!("Tunnel up"),
                        (TunnelState::On, false) => warn!("Tunnel activated, link not connected"),
                        (TunnelState::Off, _) => info!("Tunnel off, traffic goes direct"),
                    }
                    last = current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                manager.set_mode(TunnelMode::Disable);
                break;
            }
        }
    }
}

async fn probe_entries(entries: &[ServerEntry]) -> Result<()> {
    let targets: Vec<ProbeTarget> = entries.iter().filter_map(ProbeTarget::from_entry).collect();
    if targets.is_empty() {
        bail!(
            "No entry defines a UDP mirror port ({})",
            format_server_list(entries)
        );
    }

    for target in &targets {
        let reachable = UdpMirrorProbe::check(target).await;
        println!(
            "{}\t{}",
            target.mirror,
            if reachable { "reachable" } else { "unreachable" }
        );
        if reachable {
            info!("Direct UDP works, no tunnel needed");
            return Ok(());
        }
    }

    info!("No UDP mirror answered, the tunnel is required");
    Ok(())
}
