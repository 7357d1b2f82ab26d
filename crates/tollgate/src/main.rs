//! Tollgate: proxy session host
//!
//! Desktop entry point. Initializes the global allocator and logging, then
//! runs one administrative command against the session data directory.
//! There is no desktop TUN backend, so `run` supervises the engine only.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tollgate_session::{
    BridgeHost, FileKeyStore, PermissionProbe, PlatformBindings, RoutingMode, SessionConfig,
    SessionContext, TunBuilder, TunInterface, TunPlatform, TunSettingsPatch, TunnelEngine,
    TunnelError,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Proxy session host")]
struct Cli {
    /// Host config file (.toml or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, used when no config file is given
    #[arg(long, global = true, default_value = "tollgate-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the default engine config if missing and print its path
    Init,
    /// Start the engine and supervise it until Ctrl-C
    Run,
    /// Print the effective host configuration
    Config,
    /// Tunnel settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Per-app routing
    #[command(subcommand)]
    Routing(RoutingCommand),
    /// Encrypted credentials
    #[command(subcommand)]
    Secret(SecretCommand),
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Get,
    Set(SettingsArgs),
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[arg(long)]
    mtu: Option<u32>,
    #[arg(long)]
    auto_route: Option<bool>,
    #[arg(long)]
    strict_route: Option<bool>,
    #[arg(long)]
    ipv6: Option<bool>,
    /// Comma-separated DNS server literals
    #[arg(long, value_delimiter = ',')]
    dns: Option<Vec<String>>,
}

#[derive(Debug, Subcommand)]
enum RoutingCommand {
    Show,
    /// proxy_all, proxy_selected or bypass_selected
    Mode { mode: String },
    Toggle { package: String },
}

#[derive(Debug, Subcommand)]
enum SecretCommand {
    Get { service: String, key: String },
    Set { service: String, key: String, value: String },
    Delete { service: String, key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::new(&cli.data_dir),
    };

    let bindings = headless_bindings(&config);
    let ctx = SessionContext::open(config, bindings)?;
    let commands = ctx.commands();

    match cli.command {
        Command::Init => {
            let path = ctx.supervisor.ensure_config_file()?;
            println!("{}", path.display());
        }
        Command::Run => run(&ctx).await?,
        Command::Config => print!("{}", ctx.config.to_toml()),
        Command::Settings(SettingsCommand::Get) => {
            let settings = commands.tunnel_settings_get().await?;
            println!("{:#?}", settings);
        }
        Command::Settings(SettingsCommand::Set(args)) => {
            let patch = TunSettingsPatch {
                mtu: args.mtu,
                auto_route: args.auto_route,
                strict_route: args.strict_route,
                ipv6: args.ipv6,
                dns_servers: args.dns,
            };
            if patch.is_empty() {
                bail!("nothing to change");
            }
            let settings = commands.tunnel_settings_patch(patch).await?;
            println!("{:#?}", settings);
        }
        Command::Routing(RoutingCommand::Show) => {
            let selection = commands.routing_selection();
            println!("mode: {}", selection.mode);
            for package in &selection.packages {
                println!("  {}", package);
            }
        }
        Command::Routing(RoutingCommand::Mode { mode }) => {
            let mode: RoutingMode = mode.parse()?;
            commands.routing_mode_set(mode)?;
        }
        Command::Routing(RoutingCommand::Toggle { package }) => {
            let selected = commands.routing_toggle(&package)?;
            println!("{} {}", package, if selected { "selected" } else { "removed" });
        }
        Command::Secret(SecretCommand::Get { service, key }) => {
            match ctx.host.credential_get(&service, &key) {
                Some(value) => println!("{}", value),
                None => bail!("no credential for {}:{}", service, key),
            }
        }
        Command::Secret(SecretCommand::Set { service, key, value }) => {
            if !ctx.host.credential_set(&service, &key, &value) {
                bail!("failed to store credential {}:{}", service, key);
            }
        }
        Command::Secret(SecretCommand::Delete { service, key }) => {
            if !ctx.host.credential_delete(&service, &key) {
                bail!("failed to delete credential {}:{}", service, key);
            }
        }
    }

    Ok(())
}

async fn run(ctx: &SessionContext) -> Result<()> {
    info!("Tollgate starting...");
    info!("Using mimalloc allocator");

    ctx.state.subscribe(|snap| {
        info!("Session {} (engine running: {})", snap.state, snap.core_running);
    });

    if !ctx.host.core_start().await {
        bail!("engine failed to start, see log for details");
    }
    if let Some(url) = ctx.host.core_controller_url() {
        info!("Engine controller at {}", url);
    }

    let mut watch = tokio::time::interval(ctx.config.status_refresh());
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupted");
                break;
            }
            _ = watch.tick() => {
                let alive = ctx.host.core_is_running();
                ctx.state.set_core_running(alive);
                if !alive {
                    warn!("Engine exited unexpectedly");
                    break;
                }
            }
        }
    }

    if !ctx.host.core_stop().await {
        bail!("engine did not stop cleanly");
    }
    info!("Tollgate shutting down");
    Ok(())
}

fn headless_bindings(config: &SessionConfig) -> PlatformBindings {
    let platform = Arc::new(Headless);
    PlatformBindings {
        tun: platform.clone(),
        engine: platform.clone(),
        permission: platform,
        keystore: Arc::new(FileKeyStore::new(config.keystore_dir())),
    }
}

/// Platform stand-in for hosts without a TUN backend
struct Headless;

impl TunPlatform for Headless {
    fn new_builder(&self) -> Box<dyn TunBuilder> {
        Box::new(Headless)
    }

    fn stop_self(&self) {
        warn!("Tunnel failed on a headless host");
    }
}

impl TunBuilder for Headless {
    fn set_mtu(&mut self, _mtu: u32) -> Result<(), TunnelError> {
        Ok(())
    }

    fn add_address(&mut self, _address: std::net::IpAddr, _prefix: u8) -> Result<(), TunnelError> {
        Ok(())
    }

    fn add_route(&mut self, _address: std::net::IpAddr, _prefix: u8) -> Result<(), TunnelError> {
        Ok(())
    }

    fn add_dns_server(&mut self, _server: &str) -> Result<(), TunnelError> {
        Ok(())
    }

    fn add_allowed_application(&mut self, _package: &str) -> Result<(), TunnelError> {
        Ok(())
    }

    fn add_disallowed_application(&mut self, _package: &str) -> Result<(), TunnelError> {
        Ok(())
    }

    fn set_session(&mut self, _name: &str) {}

    fn establish(self: Box<Self>) -> Result<Option<Box<dyn TunInterface>>, TunnelError> {
        Err(TunnelError::Platform("no TUN backend on this host".into()))
    }
}

impl TunnelEngine for Headless {
    fn start_tunnel(&self, _fd: i32) -> Result<(), TunnelError> {
        Err(TunnelError::Platform("no TUN backend on this host".into()))
    }

    fn stop_tunnel(&self) -> Result<(), TunnelError> {
        Ok(())
    }
}

impl PermissionProbe for Headless {
    fn is_granted(&self) -> bool {
        false
    }
}
