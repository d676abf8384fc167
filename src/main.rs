use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use vpn_bridge::document::{classify, ConfigAdapter, FailureKind};
use vpn_bridge::vpn::parse_routes;
use vpn_bridge::Config;

#[derive(Parser)]
#[command(name = "vpn-bridge")]
#[command(about = "Tunnel lifecycle and network adaptation for a packet engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: ./vpn-bridge.toml, then ~/.vpn-bridge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the adapted engine document
    Adapt {
        /// Engine document (JSON)
        document: PathBuf,
        /// Directory the cache file goes into (default: <data_dir>/engine)
        #[arg(short, long)]
        work_dir: Option<PathBuf>,
        /// Print the no-cache fallback form instead
        #[arg(long)]
        degraded: bool,
    },
    /// Tell whether an engine error message is a cache failure
    Classify {
        /// Error text as reported by the engine
        text: String,
    },
    /// Show how the configured tunnel routes parse
    Routes,
    /// Generate default config file
    Init,
    /// Bring the tunnel device up and hold it until Ctrl+C (Linux only)
    Up,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let load_config = || match &cli.config {
        Some(path) => Config::load(path),
        None => Config::discover(),
    };

    match cli.command {
        Commands::Adapt {
            ref document,
            ref work_dir,
            degraded,
        } => {
            let config = load_config()?;
            let raw = std::fs::read_to_string(document)?;
            let work_dir = work_dir
                .clone()
                .unwrap_or_else(|| config.service.data_dir.join("engine"));
            let adapter = ConfigAdapter::new(config.adapter.clone());
            let adapted = adapter.adapt(&raw, &work_dir)?;
            let output = if degraded {
                adapted.degrade()
            } else {
                adapted
            };
            println!("{}", output.to_json_pretty());
        }
        Commands::Classify { ref text } => match classify(text) {
            FailureKind::CacheRelated => println!("cache-related: retry without cache"),
            FailureKind::Other => println!("other: no retry"),
        },
        Commands::Routes => {
            let config = load_config()?;
            let (routes, skipped) = parse_routes(&config.tunnel.routes);
            println!("Routes for {}:", config.tunnel.session);
            for route in &routes {
                let kind = if route.is_default() { " (default)" } else { "" };
                println!("  {}{}", route, kind);
            }
            for e in &skipped {
                println!("  skipped: {}", e);
            }
        }
        Commands::Init => {
            info!("Generating default config...");
            let config = Config::default();
            let path = PathBuf::from("vpn-bridge.toml");
            config.save(&path)?;
            println!("Created default config: vpn-bridge.toml");
        }
        Commands::Up => {
            let config = load_config()?;
            if let Err(e) = hold_tunnel(&config).await {
                error!("Tunnel failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
async fn hold_tunnel(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    use std::sync::Arc;
    use vpn_bridge::platform::linux::LinuxPlatform;
    use vpn_bridge::vpn::TunnelController;

    let platform = Arc::new(LinuxPlatform::new());
    let tunnel = TunnelController::new(platform, config.service.exclude_self);
    let fd = tunnel.establish(&config.tunnel)?;
    tunnel.rebind_to_active();
    println!("Tunnel {} is up (fd {})", config.tunnel.session, fd);
    println!("Press Ctrl+C to tear it down");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv().await;

    info!("Interrupted, tearing down tunnel");
    tunnel.rebind_to(None);
    tunnel.teardown();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn hold_tunnel(_config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    Err("bringing the tunnel up is only supported on Linux".into())
}
