use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{debug, error, info};

use ironswan::engine::state::WhackHandle;
use ironswan::{Engine, IronswanConfig, NullKernel};

#[derive(Parser)]
#[command(name = "ironswand")]
#[command(about = "Ironswan - IKEv2/IKEv1 keying daemon for IPsec")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the keying daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show the configured connections
    Status,
    /// Bring a connection up and report progress until it is keyed
    Up {
        /// Connection name
        conn: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Ironswan keying daemon v0.1.0");

    match cli.command {
        Commands::Start { foreground } => start_daemon(cli.config.as_deref(), foreground).await?,
        Commands::Status => show_status(cli.config.as_deref())?,
        Commands::Up { conn } => bring_up(cli.config.as_deref(), &conn).await?,
    }

    Ok(())
}

fn load(config_path: Option<&str>) -> anyhow::Result<IronswanConfig> {
    let config = IronswanConfig::load_from(config_path).map_err(|e| {
        error!("failed to load configuration: {}", e);
        anyhow::anyhow!(e)
    })?;
    debug!(
        "configuration loaded: {} connection(s), IKE port {}",
        config.connections.len(),
        config.daemon.ike_port
    );
    Ok(config)
}

async fn start_daemon(config_path: Option<&str>, foreground: bool) -> anyhow::Result<()> {
    info!("starting keying daemon...");
    if !foreground {
        info!("running in daemon mode");
    }

    let config = load(config_path)?;
    let conns = config.build_connections()?;
    info!("loaded {} connection(s)", conns.len());

    let engine = Engine::new(&config, conns, Arc::new(NullKernel));

    tokio::select! {
        result = engine.run() => {
            if let Err(e) = result {
                error!("engine stopped: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down...");
        }
    }

    info!("keying daemon stopped");
    Ok(())
}

fn show_status(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let conns = config.build_connections()?;

    println!("Configured connections:");
    for (_, conn) in conns.iter() {
        let route = &conn.spd[0];
        println!(
            "  \"{}\": {}[{}] ... {}[{}]  keying-tries {}  dpd {}",
            conn.name,
            route.this.host_addr,
            route.this.client,
            route.that.host_addr,
            route.that.client,
            conn.keying_tries,
            if conn.dpd_enabled() {
                format!("{}s/{}", conn.dpd_delay.as_secs(), conn.dpd_action)
            } else {
                "off".to_string()
            }
        );
    }
    Ok(())
}

/// One-shot operator keying: run the engine, hold the status channel
/// open, and print progress until the exchange settles.
async fn bring_up(config_path: Option<&str>, name: &str) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let conns = config.build_connections()?;
    let Some(conn_id) = conns.by_name(name) else {
        anyhow::bail!("no connection named \"{}\"", name);
    };

    let mut engine = Engine::new(&config, conns, Arc::new(NullKernel));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    engine.initiate_connection(conn_id, 1, Some(WhackHandle::new(tx))).await;

    tokio::select! {
        result = engine.run() => {
            if let Err(e) = result {
                error!("engine stopped: {}", e);
            }
        }
        _ = async {
            while let Some(line) = rx.recv().await {
                println!("{}", line);
            }
        } => {
            info!("exchange finished");
        }
        _ = signal::ctrl_c() => {
            info!("interrupted");
        }
    }
    Ok(())
}
