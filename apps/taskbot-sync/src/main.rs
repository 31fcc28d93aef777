use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use taskbot_bus::BusError;
use taskbot_sync::cache::LoggingQueryCache;
use taskbot_sync::client::SyncEvent;
use taskbot_sync::config::SyncConfig;
use taskbot_sync::telemetry::init_tracing;
use taskbot_sync::{SyncClient, Topic, metrics};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "taskbot-sync", about = "Watch TaskBot real-time sync traffic")]
struct Cli {
    /// Sync endpoint; defaults to TASKBOT_SYNC_URL or the local dev server.
    #[arg(long)]
    url: Option<String>,

    #[arg(long, env = "TASKBOT_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Topics to subscribe to, e.g. `task:42` or `workspace:9`.
    #[arg(long = "topic", value_parser = parse_topic)]
    topics: Vec<Topic>,

    #[arg(long, help = "Print prometheus metrics on exit")]
    print_metrics: bool,
}

fn parse_topic(raw: &str) -> Result<Topic, String> {
    raw.parse::<Topic>().map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_tracing(&config.log_filter);

    let client = SyncClient::new(config, Arc::new(LoggingQueryCache));
    let mut events = client.all_events();
    let _guards: Vec<_> = cli.topics.iter().cloned().map(|t| client.subscribe(t)).collect();

    info!(
        url = %cli.url.as_deref().unwrap_or(&client.config().url),
        topics = cli.topics.len(),
        authenticated = cli.token.is_some(),
        "starting taskbot-sync"
    );
    client
        .connect(cli.url.as_deref(), cli.token.clone())
        .await
        .context("initial connect failed")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, disconnecting");
                break;
            }
            event = events.recv() => match event {
                Ok(message) => log_event(&message.topic, &message.payload),
                Err(BusError::Lagged(skipped)) => warn!(skipped, "event log lagged"),
                Err(BusError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    client.shutdown().await;

    if cli.print_metrics {
        std::io::stdout()
            .write_all(&metrics::gather())
            .context("writing metrics")?;
    }
    Ok(())
}

fn log_event(topic: &str, event: &SyncEvent) {
    match event {
        SyncEvent::Connection(status) => info!(
            topic,
            state = %status.state,
            attempt = status.attempt,
            error = ?status.last_error,
            "connection"
        ),
        SyncEvent::Entity { message, keys } => info!(
            topic,
            kind = message.kind(),
            keys = ?keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "entity changed"
        ),
        SyncEvent::Presence(update) => info!(topic, update = ?update, "presence"),
        SyncEvent::Notification(payload) => info!(
            topic,
            title = ?payload.title,
            level = ?payload.level,
            body = %payload.message,
            "notification"
        ),
    }
}
