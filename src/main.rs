mod api;
mod gateway;

use clap::{Parser, Subcommand};
use gateway::Relay;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zaprelay_core::{
    config::{self, Config},
    shellexpand,
};
use zaprelay_store::Store;

#[derive(Parser)]
#[command(
    name = "zaprelay",
    version,
    about = "WhatsApp to CRM relay with flow automation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml", env = "ZAPRELAY_CONFIG")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (webhooks, operator actions) and the optional queue poller.
    Serve,
    /// Run one queue worker pass and exit. Suitable for cron.
    Work {
        /// Maximum events to process. Defaults to `queue.batch_size`.
        #[arg(short, long)]
        limit: Option<usize>,
        /// Process this event first.
        #[arg(long)]
        event_id: Option<String>,
    },
    /// Print instance, queue and failure counts.
    Status,
}

/// Stdout plus a daily-rolling file under `{data_dir}/logs`.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
fn init_logging(cfg: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.relay.log_level));

    let log_dir = PathBuf::from(shellexpand(&cfg.relay.data_dir)).join("logs");
    let (file_layer, guard) = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "zaprelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(e) => {
            eprintln!("file logging disabled: {}: {e}", log_dir.display());
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _log_guard = init_logging(&cfg);

    match cli.command {
        Commands::Serve => {
            let store = Store::new(&cfg.store).await?;
            let relay = Arc::new(Relay::from_config(&cfg, store));
            let media_dir = gateway::media_dir(&cfg.relay.data_dir);

            let poller = gateway::spawn_poller(relay.clone());
            info!("{} starting", cfg.relay.name);

            tokio::select! {
                _ = api::serve(cfg.api.clone(), relay, media_dir) => {}
                _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
            }

            if let Some(handle) = poller {
                handle.abort();
            }
        }
        Commands::Work { limit, event_id } => {
            let store = Store::new(&cfg.store).await?;
            let relay = Relay::from_config(&cfg, store);
            let limit = limit.unwrap_or(cfg.queue.batch_size);
            let processed = relay.process_batch(limit, event_id.as_deref()).await?;
            println!("processed {processed} event(s)");
        }
        Commands::Status => {
            let store = Store::new(&cfg.store).await?;
            let relay = Relay::from_config(&cfg, store);
            print_status(&cli.config, &cfg, &relay).await?;
        }
    }

    Ok(())
}

async fn print_status(config_path: &str, cfg: &Config, relay: &Relay) -> anyhow::Result<()> {
    let store = relay.store();
    println!("zaprelay status\n");
    println!("Config:   {config_path}");
    println!("Database: {}", shellexpand(&cfg.store.db_path));
    println!("Size:     {} bytes", store.db_size().await?);
    println!();

    println!("Instances:");
    let instances = store.count_instances_by_status().await?;
    if instances.is_empty() {
        println!("  none");
    }
    for (status, count) in instances {
        println!("  {status}: {count}");
    }
    println!("Open conversations: {}", store.count_open_conversations().await?);
    println!("Active integrations: {}", store.count_active_integrations().await?);
    println!();

    let queue = store.queue_counts().await?;
    println!(
        "Queue: {} pending, {} processing, {} done, {} failed",
        queue.pending, queue.processing, queue.done, queue.failed
    );

    let failures = relay.failures();
    println!("Side-effect failures: {}", failures.count().await?);
    for entry in failures.recent(5).await? {
        println!(
            "  {} {} [{}] {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.kind,
            entry.reference,
            entry.error
        );
    }
    Ok(())
}
