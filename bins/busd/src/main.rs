//! `busd` — link-local service bus daemon entry point.
//!
//! Loads the persistent GUID (C8) and daemon configuration, bootstraps the
//! bundled router launcher (C6) against a standalone null transport, waits
//! for a shutdown signal, then stops and joins the router.

use std::path::PathBuf;
use std::sync::Arc;

use busd::bundled::BundledRouterLauncher;
use busd::config;
use busd::guid::Guid;
use busd::transport::{Bus, NullTransport, RouterLauncherRegistry};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_GUID_DIR: &str = "/var/lib/busd";

#[derive(Parser, Debug)]
#[command(name = "busd", about = "Link-local service bus daemon")]
struct Cli {
    /// Optional on-disk JSON config overriding the embedded default.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the `ip_name_service.interfaces` selector (e.g. `eth0`, `*`).
    #[arg(long)]
    interfaces: Option<String>,

    /// Overrides the directory the persistent GUID file lives in.
    #[arg(long)]
    guid_dir: Option<PathBuf>,

    /// Raises the default log level; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A null transport with nowhere to splice to but this process itself: the
/// `busd` binary is its own bundled-router client.
struct StandaloneTransport;

impl NullTransport for StandaloneTransport {
    fn link_bus(&self, _bus: Arc<Bus>) {
        info!("bundled router linked");
    }

    fn disconnect(&self, endpoint_spec: &str) {
        info!(endpoint_spec, "bundled router disconnected");
    }
}

/// The `busd` binary doesn't need a process-wide registry beyond what
/// [`BundledRouterLauncher::bootstrap`]'s `OnceLock` already provides; this
/// exists only to satisfy the [`RouterLauncherRegistry`] contract C6 needs.
struct StandaloneRegistry;

impl RouterLauncherRegistry for StandaloneRegistry {
    fn register_router_launcher(&self, _launcher: Arc<BundledRouterLauncher>) {}
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> busd::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let guid_dir = cli.guid_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_GUID_DIR));
    let guid = Guid::persistent(&guid_dir)?;
    info!(%guid, guid_dir = %guid_dir.display(), "daemon identity loaded");

    let daemon_config = config::load(cli.config.as_deref(), cli.interfaces.as_deref())?;
    info!(interfaces = %daemon_config.ip_name_service.interfaces, "configuration loaded");

    let registry = StandaloneRegistry;
    let launcher = BundledRouterLauncher::bootstrap(guid, daemon_config, &registry);
    let transport: Arc<dyn NullTransport> = Arc::new(StandaloneTransport);

    launcher.start(transport.clone()).await?;
    info!("bundled router started, awaiting shutdown signal");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down anyway");
    }

    info!("shutting down");
    launcher.stop(&transport).await?;
    launcher.join().await;
    Ok(())
}
