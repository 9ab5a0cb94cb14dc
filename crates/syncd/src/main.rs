//! Headless sync daemon: keeps the outbox draining while the backend is up.
//!
//! Reads line commands from stdin in place of platform network signals.

mod command;

use std::sync::Arc;

use anyhow::Context;
use fastnow_connectivity::{ConnectionMonitor, HttpBackend, SyncConfig};
use fastnow_events::{EventBus, InMemoryEventBus, SyncEvent};
use fastnow_outbox::{Outbox, SqliteOutboxStore};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::command::Command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fastnow_observability::init();

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    tracing::info!(api_url = %config.api_url, "starting sync daemon");

    let store = match &config.outbox_db {
        Some(path) => SqliteOutboxStore::open(path).await?,
        None => SqliteOutboxStore::open_default().await?,
    };

    let events = Arc::new(InMemoryEventBus::<SyncEvent>::new());
    spawn_event_logger(&events);

    let outbox = Outbox::new(Arc::new(store), events);
    if let Err(err) = outbox.purge_mappings(config.mapping_retention).await {
        tracing::warn!(error = %err, "failed to purge expired id mappings");
    }
    let pending = outbox.pending_count().await.context("failed to read outbox")?;
    tracing::info!(pending, "outbox opened");

    let backend = HttpBackend::from_config(&config)?;
    let monitor = ConnectionMonitor::new(Arc::new(backend), outbox, config.monitor.clone());

    let (signals, signal_rx) = mpsc::channel(16);
    monitor
        .start_monitoring(signal_rx)
        .context("failed to start connection monitor")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => {
                        if !run_command(&monitor, &signals, command).await? {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring input"),
                }
            }
        }
    }

    monitor.stop_monitoring().await;
    tracing::info!("sync daemon stopped");
    Ok(())
}

/// Returns `false` once the monitor no longer accepts signals.
async fn run_command(
    monitor: &ConnectionMonitor,
    signals: &mpsc::Sender<fastnow_connectivity::NetworkSignal>,
    command: Command,
) -> anyhow::Result<bool> {
    match command {
        Command::Signal(signal) => {
            if signals.send(signal).await.is_err() {
                tracing::warn!("connection monitor is not running");
                return Ok(false);
            }
        }
        Command::Retry => {
            let connected = monitor.force_retry().await;
            println!("{}", json!({ "connected": connected }));
        }
        Command::Status => {
            let pending = monitor.outbox().pending_count().await?;
            println!(
                "{}",
                json!({ "state": monitor.state(), "pending": pending })
            );
        }
        Command::Drain => {
            let report = monitor.process_queue().await;
            println!("{}", serde_json::to_string(&report)?);
        }
    }
    Ok(true)
}

/// Log every sync event from a dedicated thread; ends when the bus is dropped.
fn spawn_event_logger(events: &Arc<InMemoryEventBus<SyncEvent>>) {
    let subscription = events.subscribe();
    std::thread::spawn(move || {
        while let Ok(event) = subscription.recv() {
            match &event {
                SyncEvent::OperationDropped {
                    operation_id,
                    entity,
                    action,
                    reason,
                } => tracing::warn!(
                    %operation_id,
                    %entity,
                    %action,
                    %reason,
                    "operation dropped"
                ),
                other => tracing::info!(event = other.name(), payload = ?other, "sync event"),
            }
        }
    });
}
