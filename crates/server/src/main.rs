//! Herald delivery daemon entry point.
//!
//! Reads one message per line from stdin as `<target> <payload>` and delivers
//! it through a rate-limited [`Sender`]. The payload is either a JSON object
//! or plain text, which is sent as `{"content": <text>}`. A leading `!` on the
//! target marks the message urgent.

use std::sync::Arc;

use anyhow::Context;
use herald_common::{AppError, Config};
use herald_queue::{HttpTransport, Priority, QueueOptions, Sender, SenderEvent};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Parse `<target> <payload>` into a target, priority and JSON payload.
fn parse_line(line: &str) -> Option<(String, Priority, Value)> {
    let line = line.trim();
    let (target, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }

    let (target, priority) = match target.strip_prefix('!') {
        Some(target) => (target, Priority::Urgent),
        None => (target, Priority::Normal),
    };
    if target.is_empty() {
        return None;
    }

    let payload = match serde_json::from_str::<Value>(rest) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "content": rest }),
    };
    Some((target.to_string(), priority, payload))
}

/// Log every lifecycle event until the sender goes away.
async fn log_events(sender: Arc<Sender>) {
    let mut events = sender.subscribe();
    drop(sender);

    loop {
        match events.recv().await {
            Ok(SenderEvent::RateLimited {
                kind,
                retry_after_ms,
                reason,
                ..
            }) => {
                warn!(kind = %kind, retry_after_ms, reason = %reason, "Sends held back");
            }
            Ok(event) => {
                let detail = serde_json::to_string(&event).unwrap_or_default();
                debug!(event = event.name(), detail = %detail, "Sender event");
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Queue every stdin line until EOF.
async fn feed_stdin(sender: Arc<Sender>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let Some((target, priority, payload)) = parse_line(&line) else {
            if !line.trim().is_empty() {
                warn!(line = %line, "Ignoring malformed line, expected `<target> <payload>`");
            }
            continue;
        };

        let handle = match sender.queue_message(target, payload, QueueOptions::priority(priority))
        {
            Ok(handle) => handle,
            Err(e) => {
                AppError::from(e).log();
                continue;
            }
        };

        tokio::spawn(async move {
            let id = handle.id().to_string();
            match handle.await {
                Ok(delivery) => info!(
                    message_id = %delivery.id,
                    retry_count = delivery.retry_count,
                    queue_time_ms = delivery.queue_time.as_millis() as u64,
                    "Delivered"
                ),
                Err(e) => error!(message_id = %id, error = %e, "Not delivered"),
            }
        });
    }

    info!("Reached end of input");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug".into()),
        )
        .init();

    info!("Starting herald...");

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    if let Err(e) = config.check() {
        e.log();
        return Err(e.into());
    }

    let transport = Arc::new(HttpTransport::new(&config.transport)?);
    let shutdown_timeout = config.delivery.shutdown_timeout();
    let sender = Arc::new(Sender::new(config.delivery, transport));

    tokio::spawn(log_events(Arc::clone(&sender)));
    sender.start_processing();
    info!(base_url = %config.transport.base_url, "Ready for messages on stdin");

    tokio::select! {
        result = feed_stdin(Arc::clone(&sender)) => result?,
        () = shutdown_signal() => {},
    }

    let cancelled = sender.shutdown(shutdown_timeout).await;
    let metrics = sender.metrics();
    info!(
        cancelled,
        delivered = metrics.delivery.successful_sends,
        failed = metrics.delivery.failed_sends,
        retries = metrics.retry.total_retry_attempts,
        rate_limit_hits = metrics.rate_limiter.rate_limit_hits,
        "Herald shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let (target, priority, payload) = parse_line("12345 deploy finished").unwrap();
        assert_eq!(target, "12345");
        assert_eq!(priority, Priority::Normal);
        assert_eq!(payload, json!({"content": "deploy finished"}));
    }

    #[test]
    fn test_parse_json_and_urgent() {
        let (target, priority, payload) =
            parse_line("!ops {\"content\": \"disk full\", \"tts\": true}").unwrap();
        assert_eq!(target, "ops");
        assert_eq!(priority, Priority::Urgent);
        assert_eq!(payload["tts"], true);
    }

    #[test]
    fn test_parse_rejects_incomplete_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("lonely-target").is_none());
        assert!(parse_line("! text").is_none());
    }
}
