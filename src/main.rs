use std::env;

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::database::database::Database;
use crate::discord::bot::PinguBot;

mod config;
mod database;
mod discord;

fn main() -> anyhow::Result<()> {
    let (_file_guard, _stdout_guard) = init_logging();

    let config_path = env::var("PINGU_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;
    tracing::info!("Loaded configuration from {}", config_path);

    let database = Database::new(&config.database_url)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(PinguBot::new(config, database).run_bot())
}

fn init_logging() -> (tracing_appender::non_blocking::WorkerGuard, tracing_appender::non_blocking::WorkerGuard) {
    let file_appender = tracing_appender::rolling::daily("logs/", "pingu.log");
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::Layer::new()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_writer(non_blocking)
        .with_filter(LevelFilter::WARN);

    let (non_blocking, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdout_layer = tracing_subscriber::fmt::Layer::new()
        .compact()
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(non_blocking)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,serenity=warn,songbird=warn")));

    Registry::default().with(file_layer).with(stdout_layer).init();

    (file_guard, stdout_guard)
}
