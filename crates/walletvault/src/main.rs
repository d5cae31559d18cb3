#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use serde_json::Value;
use std::io::Write as _;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

use walletvault::{
    config,
    keystore::storage::{FileStorage, MemoryStorage, StorageBackend},
    paths, rpc,
    rpc::envelope::MessageType,
    vault,
};

#[derive(Parser, Debug)]
#[command(name = "walletvault", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the command bus over stdin/stdout (newline-delimited JSON envelopes).
    Stdio {
        /// Keep the vault in memory only; nothing is written to the data dir.
        #[arg(long, default_value_t = false)]
        in_memory: bool,
    },

    /// Run the singleton daemon on a Unix socket in the data dir.
    Daemon {
        /// Exit after being idle (no active clients) for this many seconds.
        ///
        /// Falls back to `[daemon] idle_exit_seconds` in config.toml. If both are unset,
        /// runs until terminated.
        #[arg(long)]
        idle_exit_seconds: Option<u64>,
    },

    /// Send one call to the running daemon and print the result envelope.
    ///
    /// Each argument is parsed as JSON; anything that is not valid JSON is sent as a
    /// string.
    Call {
        message_type: MessageType,
        args: Vec<String>,
    },

    /// Print resolved paths (useful for debugging).
    Paths,
}

fn init_logging(paths: &paths::VaultPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("walletvault.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn parse_cli_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_e| Value::String(raw.to_owned()))
}

fn build_bus(
    storage: Arc<dyn StorageBackend>,
    paths: &paths::VaultPaths,
    cfg: &config::VaultConfig,
) -> eyre::Result<Arc<rpc::bus::CommandBus>> {
    let vault = vault::Vault::for_host(storage, paths, cfg);
    Ok(Arc::new(vault.into_bus().context("wire command bus")?))
}

fn file_storage(paths: &paths::VaultPaths) -> Arc<dyn StorageBackend> {
    Arc::new(FileStorage::new(paths.keys_file.clone(), paths.keys_lock()))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::VaultPaths::discover()?;
    paths.ensure_private_dirs().context("create vault dirs")?;
    let _log_guard = init_logging(&paths);
    let cfg = config::ConfigStore::new(&paths)
        .load_or_init_default()
        .context("load config")?;

    match cli.cmd {
        Command::Stdio { in_memory } => {
            let storage: Arc<dyn StorageBackend> = if in_memory {
                Arc::new(MemoryStorage::new())
            } else {
                file_storage(&paths)
            };
            let bus = build_bus(storage, &paths, &cfg)?;
            rpc::server::run_stdio(bus)
                .await
                .context("stdio server failed")
        }
        Command::Daemon { idle_exit_seconds } => {
            let bus = build_bus(file_storage(&paths), &paths, &cfg)?;
            let idle = idle_exit_seconds.or(cfg.daemon.idle_exit_seconds);
            rpc::server::run_daemon(&paths, bus, idle)
                .await
                .context("daemon failed")
        }
        Command::Call { message_type, args } => {
            let client = rpc::server::connect_daemon(&paths).await?;
            let args = args.iter().map(|a| parse_cli_arg(a)).collect();
            let resp = client.call_envelope(message_type, args).await?;
            let s = serde_json::to_string(&resp).context("serialize result envelope")?;
            writeln!(std::io::stdout().lock(), "{s}").context("write result envelope")?;
            if let Some(err) = resp.error {
                return Err(err.into_report());
            }
            Ok(())
        }
        Command::Paths => {
            let s = serde_json::to_string(&paths).context("serialize paths")?;
            writeln!(std::io::stdout().lock(), "{s}").context("write paths")?;
            Ok(())
        }
    }
}
