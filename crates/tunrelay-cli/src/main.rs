use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tunrelay_core::adapter::{EndpointId, ProxyStream};
use tunrelay_core::config::Config;
use tunrelay_core::metadata::Metadata;
use tunrelay_core::pool::BufferPool;
use tunrelay_core::proxy::{DirectDialer, Dialer};
use tunrelay_core::relay::Relay;
use tunrelay_core::stats::StatsSnapshot;
use tunrelay_core::tracker::Tracker;
use tunrelay_core::tunnel::Tunnel;
use tunrelay_stack::{RedirectStack, Stack};

#[derive(Parser)]
#[command(name = "tunrelay")]
#[command(about = "tunrelay - relay engine for connections captured off a virtual interface")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log file directory (enables file logging)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing redirected connections and relay them
    Run,
    /// Validate the configuration file
    Validate,
    /// Generate a default configuration file
    Init,
    /// Dial a destination the way the relay would and report the latency
    Probe {
        /// Destination address, e.g. 93.184.216.34:80
        target: SocketAddr,

        /// Connect timeout in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(configured_log_level(&cli.config))?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Optional file logging
    let _guard = if let Some(ref log_dir) = cli.log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, "tunrelay.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    match cli.command {
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Init => cmd_init(&cli.config),
        Commands::Probe { target, timeout } => cmd_probe(&cli.config, target, timeout).await,
    }
}

/// Log level from the config file, or `info` when it cannot be read yet.
fn configured_log_level(config_path: &Path) -> String {
    Config::load(config_path)
        .map(|config| config.general.log_level)
        .unwrap_or_else(|_| "info".to_string())
}

async fn cmd_run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let listen_addr = config.listen_addr()?;
    let relay_config = config.relay_config();

    tracing::info!(
        listen = %listen_addr,
        tcp_wait_timeout = ?relay_config.tcp_wait_timeout,
        udp_timeout = ?relay_config.udp_timeout,
        idle_timeout = ?relay_config.idle_timeout,
        "starting tunrelay"
    );

    let pool = BufferPool::new(config.relay.pool_class_capacity);
    let relay = Relay::new(relay_config, Arc::clone(&pool));
    let tracker = Tracker::new();
    let dialer = Arc::new(config.direct_dialer());
    let tunnel = Arc::new(Tunnel::new(dialer, relay, Arc::clone(&tracker)));

    let mut stack = RedirectStack::new(listen_addr, config.stack.channel_capacity);
    let events = stack.start().await?;
    tracing::info!("capture started, press Ctrl+C to stop");

    let shutdown = CancellationToken::new();
    let tunnel_task = tokio::spawn(Arc::clone(&tunnel).run(events, shutdown.clone()));

    let sampler = {
        let tracker = Arc::clone(&tracker);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => tracker.stats().sample_bandwidth(),
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    shutdown.cancel();
    stack.stop().await?;
    tunnel_task.await?;
    sampler.await?;

    print_summary(&tracker.snapshot(10), tracker.sessions().len());

    let pool_stats = pool.stats();
    tracing::debug!(
        allocations = pool_stats.allocations,
        reuses = pool_stats.reuses,
        returns = pool_stats.returns,
        drops = pool_stats.drops,
        "buffer pool"
    );

    Ok(())
}

fn print_summary(snapshot: &StatsSnapshot, still_open: usize) {
    println!("Traffic summary:");
    println!("  Upload: {} bytes", snapshot.total_upload);
    println!("  Download: {} bytes", snapshot.total_download);
    println!(
        "  Connections: {} tcp, {} udp ({} still open)",
        snapshot.total_tcp, snapshot.total_udp, still_open
    );
    println!("  Dial failures: {}", snapshot.dial_failures);

    if !snapshot.top_destinations.is_empty() {
        println!("  Top destinations:");
        for dest in &snapshot.top_destinations {
            println!(
                "    {} - {} conns, {} up / {} down",
                dest.destination, dest.connection_count, dest.upload, dest.download
            );
        }
    }
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    println!("Configuration is valid.");
    println!("  Listen: {}", config.stack.listen_addr);
    println!("  Log level: {}", config.general.log_level);
    println!("  TCP wait timeout: {}s", config.relay.tcp_wait_timeout_secs);
    println!("  UDP timeout: {}s", config.relay.udp_timeout_secs);
    match config.relay.idle_timeout_secs {
        Some(secs) => println!("  Idle timeout: {}s", secs),
        None => println!("  Idle timeout: none"),
    }
    println!("  Connect timeout: {}s", config.dialer.connect_timeout_secs);
    match config.dialer.bind_addr {
        Some(addr) => println!("  Bind address: {}", addr),
        None => println!("  Bind address: system default"),
    }
    Ok(())
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("config file already exists: {}", config_path.display());
    }

    let config = Config::default_config();
    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(config_path, yaml)?;
    println!("Default config written to {}", config_path.display());
    Ok(())
}

async fn cmd_probe(config_path: &Path, target: SocketAddr, timeout_secs: u64) -> Result<()> {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        Config::default_config()
    };

    let mut dialer = DirectDialer::new(Duration::from_secs(timeout_secs));
    if let Some(addr) = config.dialer.bind_addr {
        dialer = dialer.with_bind_addr(addr);
    }

    let probe_src = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    let metadata = Metadata::from_endpoint(&EndpointId::tcp(target, probe_src));

    let started = Instant::now();
    match dialer.dial_tcp(&metadata).await {
        Ok(stream) => {
            let local = stream
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            println!(
                "  [OK] {} - {}ms (via {})",
                target,
                started.elapsed().as_millis(),
                local
            );
        }
        Err(e) => {
            println!("  [FAIL] {} - {}", target, e);
        }
    }

    Ok(())
}
