use clap::Parser;
use std::sync::Arc;
use waspconnd::config::{Config, LoggingConfig};
use waspconnd::server::{BridgeNode, BridgeServer};
use waspconnd::shutdown::ShutdownManager;
use waspconnd::utxodb::confirm::ConfirmEmulator;
use waspconnd::utxodb::{REQUEST_FUNDS_AMOUNT, SUPPLY};
use waspconnd::webapi::WebApiServer;

#[derive(Parser, Debug)]
#[command(name = "waspconnd")]
#[command(about = "Bridge node between the value tangle and wasp clients", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "waspconn.toml")]
    config: String,

    /// Override the wasp listener port from the config file
    #[arg(long)]
    port: Option<u16>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = Config::load_or_default(&args.config);
    if let Some(port) = args.port {
        config.waspconn.port = port;
    }

    setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    tracing::info!("waspconnd v{} starting", version);

    if !config.waspconn.utxodb_enabled {
        eprintln!(
            "error: no value tangle source is linked into this build; \
             set waspconn.utxodb_enabled = true to run against the emulator"
        );
        std::process::exit(1);
    }

    let emulator = Arc::new(ConfirmEmulator::new(config.waspconn.confirm_config()));
    log_ledger_banner(&emulator);

    let mut shutdown_manager = ShutdownManager::new();
    let token = shutdown_manager.token();

    shutdown_manager.register_task(emulator.spawn_confirm_loop(token.clone()));

    let node = Arc::new(BridgeNode::with_emulator(emulator.clone()));

    let listen_addr = format!("0.0.0.0:{}", config.waspconn.port);
    let server = match BridgeServer::bind(&listen_addr, node.clone()).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to bind wasp listener on {}: {}", listen_addr, e);
            std::process::exit(1);
        }
    };
    shutdown_manager.register_task(tokio::spawn(server.run(token.clone())));

    if config.webapi.enabled {
        let api = match WebApiServer::bind(
            &config.webapi.bind_address,
            node.connect_ledger(),
            token.clone(),
        )
        .await
        {
            Ok(api) => api,
            Err(e) => {
                eprintln!(
                    "failed to bind web API on {}: {}",
                    config.webapi.bind_address, e
                );
                std::process::exit(1);
            }
        };
        shutdown_manager.register_task(tokio::spawn(api.run()));
    }

    shutdown_manager.wait_for_shutdown().await;
}

fn log_ledger_banner(emulator: &ConfirmEmulator) {
    let utxodb = emulator.utxodb();
    tracing::info!(
        "UTXO emulator initialized: supply {}, faucet amount {}",
        SUPPLY,
        REQUEST_FUNDS_AMOUNT
    );
    tracing::info!("genesis address: {}", utxodb.genesis_address());
    for (addr, stats) in utxodb.ledger_stats() {
        tracing::info!(
            "  {}: balance {}, num outputs {}",
            addr,
            stats.total,
            stats.num_outputs
        );
    }
    let config = emulator.config();
    tracing::info!(
        "confirmation delay {:?} (randomize: {}, confirm first in conflict: {})",
        config.confirm_time,
        config.randomize,
        config.confirm_first_in_conflict
    );
}

fn setup_logging(config: &LoggingConfig, verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact()
                .init();
        }
    }
}
