//! TideKV - An In-Memory Key-Value Server
//!
//! This is the main entry point for the TideKV server.
//! It sets up logging, the storage engine and the reactor server, then waits
//! for Ctrl+C to shut everything down in order.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tidekv::server::{Balancer, Server, ServerConfig};
use tidekv::storage::{start_expiry_sweeper, Storage, StorageEngine};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Parse configuration from command-line arguments
fn config_from_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" | "-h" => {
                config.host = value_of(&args, i).to_string();
                i += 2;
            }
            "--port" | "-p" => {
                config.port = parse_value(&args, i);
                i += 2;
            }
            "--workers" | "-w" => {
                config.workers = parse_value(&args, i);
                i += 2;
            }
            "--balancer" | "-b" => {
                config.balancer = parse_value::<Balancer>(&args, i);
                i += 2;
            }
            "--low-watermark" => {
                config.executor.low_watermark = parse_value(&args, i);
                i += 2;
            }
            "--high-watermark" => {
                config.executor.high_watermark = parse_value(&args, i);
                i += 2;
            }
            "--max-queue" => {
                config.executor.max_queue_size = parse_value(&args, i);
                i += 2;
            }
            "--idle-timeout-ms" => {
                config.executor.idle_timeout = Duration::from_millis(parse_value(&args, i));
                i += 2;
            }
            "--drain-timeout-ms" => {
                config.drain_timeout = Duration::from_millis(parse_value(&args, i));
                i += 2;
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("TideKV version {}", tidekv::VERSION);
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    if config.workers == 0 {
        eprintln!("Error: --workers must be at least 1");
        std::process::exit(1);
    }

    config
}

fn value_of(args: &[String], i: usize) -> &str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", args[i]);
            std::process::exit(1);
        }
    }
}

fn parse_value<T: FromStr>(args: &[String], i: usize) -> T {
    let value = value_of(args, i);
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}: {}", args[i], value);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
TideKV - An In-Memory Key-Value Server

USAGE:
    tidekv [OPTIONS]

OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>              Port to listen on (default: 11211)
    -w, --workers <N>              Reactor threads (default: CPU count)
    -b, --balancer <NAME>          round-robin | least-loaded (default: round-robin)
        --low-watermark <N>        Executor threads kept alive when idle
        --high-watermark <N>       Maximum executor threads
        --max-queue <N>            Maximum queued commands before rejecting
        --idle-timeout-ms <MS>     Idle time before a surplus thread retires
        --drain-timeout-ms <MS>    Time shutdown waits for connections to drain
    -v, --version                  Print version information
        --help                     Print this help message

LOGGING:
    Set RUST_LOG to change the log filter (default: info).

CONNECTING:
    Use any memcached client, or plain telnet:
    $ telnet 127.0.0.1 11211
    set name 0 0 4
    Ariz
    STORED
    get name
    VALUE name 0 4
    Ariz
    END
"#
    );
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
TideKV v{} - In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Listening on {}
Reactors: {}   Executor threads: {}..={}   Queue: {}

Use Ctrl+C to shutdown gracefully.
"#,
        tidekv::VERSION,
        config.bind_address(),
        config.workers,
        config.executor.low_watermark,
        config.executor.high_watermark,
        config.executor.max_queue_size,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config_from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();

    print_banner(&config);

    let storage = Arc::new(StorageEngine::new());
    info!("Storage engine initialized with 64 shards");

    let sweeper = start_expiry_sweeper(Arc::clone(&storage));

    let backend: Arc<dyn Storage> = Arc::clone(&storage) as Arc<dyn Storage>;
    let server = Arc::new(Server::new(config, backend));
    server.start()?;

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    // Stopping blocks while connections drain
    let stopping = Arc::clone(&server);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;
    sweeper.shutdown().await;

    let stats = storage.stats();
    info!(
        keys = stats.keys,
        gets = stats.get_ops,
        sets = stats.set_ops,
        expired = stats.expired,
        "Final storage statistics"
    );

    info!("Server shutdown complete");
    Ok(())
}
