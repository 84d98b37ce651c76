//! SnapKV server binary.
//!
//! Parses the command line, restores the last snapshot, serves clients, and
//! turns Ctrl+C into a graceful shutdown that writes a final snapshot.

use anyhow::Context;
use snapkv::config::{parse_args, CliCommand};
use snapkv::{LoadOutcome, Server, ServerConfig, StorageEngine};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_help() {
    println!(
        r#"
SnapKV - An In-Memory Key-Value Server with Snapshots

USAGE:
    snapkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>             Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>             Port to listen on (default: 6379)
    -f, --dump-file <PATH>        Snapshot file (default: dump.my_rdb)
    -s, --save-interval <SECS>    Seconds between snapshots, 0 to disable (default: 300)
    -v, --version                 Print version information
        --help                    Print this help message

EXAMPLES:
    snapkv                                 # Start on 127.0.0.1:6379
    snapkv --port 6380 --save-interval 60  # Snapshot every minute
    snapkv --dump-file /var/lib/snapkv.db  # Custom snapshot location

CONNECTING:
    Use redis-cli or any Redis client to connect:
    $ redis-cli -p 6379
    127.0.0.1:6379> RPUSH jobs build test
    (integer) 2
    127.0.0.1:6379> HSET user:1 name Ariz
    (integer) 1
"#
    );
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
SnapKV v{} - In-Memory Key-Value Server
──────────────────────────────────────────────
Address:   {}
Snapshot:  {} (every {}s)

Use Ctrl+C to shutdown gracefully.
"#,
        snapkv::VERSION,
        config.bind_address(),
        config.snapshot_path.display(),
        config.snapshot_interval.as_secs()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match parse_args(std::env::args().skip(1)) {
        Ok(CliCommand::Run(config)) => config,
        Ok(CliCommand::Help) => {
            print_help();
            return Ok(());
        }
        Ok(CliCommand::Version) => {
            println!("SnapKV version {}", snapkv::VERSION);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner(&config);

    let storage = Arc::new(StorageEngine::new());
    let server = Arc::new(Server::new(config.clone(), storage));

    // A snapshot that exists but cannot be read is not overwritten
    match server.load_snapshot().with_context(|| {
        format!(
            "refusing to start: cannot load {}",
            config.snapshot_path.display()
        )
    })? {
        LoadOutcome::NoSnapshot => info!("Starting with an empty keyspace"),
        LoadOutcome::Loaded { keys, expired } => {
            info!(keys, expired, "Restored keyspace from snapshot")
        }
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping server...");
                shutdown.shutdown();
            }
            Err(e) => error!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}
