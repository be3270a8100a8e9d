use std::sync::Arc;

use anyhow::Context;
use bot_store::config::StoreConfig;
use bot_store::controller::Controller;
use bot_store::migrate::Migrator;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: bot-store [serve | migrate [--force] | status]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = StoreConfig::from_env();
    config.validate().context("invalid configuration")?;

    match args.first().map(String::as_str) {
        None | Some("serve") => serve(config).await,
        Some("migrate") => migrate(config, args.iter().any(|a| a == "--force")).await,
        Some("status") => status(config).await,
        Some("-h" | "--help") => {
            eprintln!("{USAGE}");
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

/// Stderr logging filtered by `RUST_LOG`, plus a daily rolling file when
/// `LOG_DIR` is set. The guard must live until exit to flush the file writer.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("LOG_DIR").ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            use tracing_subscriber::layer::SubscriberExt;
            use tracing_subscriber::util::SubscriberInitExt;

            let appender = tracing_appender::rolling::daily(dir, "bot-store.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .init();
            None
        }
    }
}

async fn serve(config: StoreConfig) -> anyhow::Result<()> {
    eprintln!("🗄️  Bot Store v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database.target.display());
    eprintln!("   Legacy file: {}", config.fallback.legacy_path.display());

    let controller = Arc::new(Controller::new(config));
    controller
        .initialize()
        .await
        .context("store failed to start")?;

    let status = controller.status();
    eprintln!(
        "   Backend: {} ({})",
        status.backend.map(|b| b.to_string()).unwrap_or_default(),
        status.state
    );
    eprintln!("   Records: {}", controller.data().await.record_count());
    eprintln!("   Press Ctrl-C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    eprintln!("Flushing snapshot...");
    controller.write().await.context("final flush failed")?;
    controller.close().await;
    Ok(())
}

async fn migrate(config: StoreConfig, force: bool) -> anyhow::Result<()> {
    let migrator = Migrator::connect(&config)
        .await
        .context("cannot reach the relational store")?;
    let outcome = if force {
        migrator.run_forced().await
    } else {
        migrator.run().await
    };
    migrator.close();

    let outcome = outcome.context("migration failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn status(config: StoreConfig) -> anyhow::Result<()> {
    let controller = Controller::new(config);
    controller
        .initialize()
        .await
        .context("store failed to start")?;
    let report = controller.health_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    controller.close().await;
    Ok(())
}
