use std::sync::Arc;

use tokio::sync::broadcast;

use maildesk::config::{ClassifierConfig, PipelineConfig};
use maildesk::mailbox::auth::{RefresherConfig, TokenRefresher};
use maildesk::pipeline::{Classifier, HttpClassifier, MailboxSupervisor, MessageProcessor};
use maildesk::store::{LibSqlStore, TicketStore};
use maildesk::tickets::events::EventBus;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PipelineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: invalid configuration: {}", e);
        std::process::exit(1);
    });

    let Some(classifier_config) = ClassifierConfig::from_env() else {
        eprintln!("Error: MAILDESK_CLASSIFIER_URL not set");
        eprintln!("  export MAILDESK_CLASSIFIER_URL=https://classifier.example.com/v1/label");
        std::process::exit(1);
    };

    eprintln!("📬 maildesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Poll interval: {}s", config.poll_interval.as_secs());
    eprintln!("   Batch size: {} messages/cycle", config.batch_size);
    eprintln!("   Classifier: {}", classifier_config.endpoint_url);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("MAILDESK_DB_PATH").unwrap_or_else(|_| "./data/maildesk.db".to_string());

    let store: Arc<dyn TicketStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", db_path);

    let http = reqwest::Client::new();

    // ── OAuth refresh (API mailboxes) ────────────────────────────────────
    let refresher = match RefresherConfig::from_env() {
        Some(refresher_config) => {
            eprintln!("   OAuth refresh: enabled");
            Some(Arc::new(TokenRefresher::new(
                refresher_config,
                Arc::clone(&store),
                http.clone(),
                config.token_refresh_margin,
            )))
        }
        None => {
            eprintln!("   OAuth refresh: not configured (IMAP mailboxes only)");
            None
        }
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let classifier: Arc<dyn Classifier> = Arc::new(HttpClassifier::new(
        classifier_config,
        &config,
        http.clone(),
    ));
    let events = EventBus::new();

    // Live event feed to the log; durable notifications are written by the
    // pipeline itself.
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    tracing::info!(ticket = %event.number(), "{}", event.feed_text());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&store),
        classifier,
        events.clone(),
        config.clone(),
    ));
    let supervisor = Arc::new(MailboxSupervisor::new(
        Arc::clone(&store),
        processor,
        http,
        refresher,
        config,
    ));

    // ── Resume pollers ───────────────────────────────────────────────────
    let resumed = supervisor.resume_connected().await?;
    eprintln!("   Mailboxes: {} poller(s) resumed\n", resumed);

    // Run until interrupted, then stop every poller cleanly.
    tokio::signal::ctrl_c().await?;
    eprintln!("\nShutting down...");
    supervisor.shutdown_all().await;

    Ok(())
}
