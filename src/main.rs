//! Teams Recorder - compliance recording call handler for Microsoft Teams
//!
//! Receives call notifications, answers calls, drives the recording status
//! protocol and keeps the push subscriptions (or a polling fallback) alive.

mod api;
mod auth;
mod calling;
mod config;
mod models;
mod polling;
mod recording;
mod server;
mod subscriptions;
mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{GraphClient, SubscriptionApi};
use crate::calling::{always_answer, CallStateMachine};
use crate::config::Config;
use crate::models::parse_change_types;
use crate::polling::PollingService;
use crate::recording::{ComplianceOrchestrator, LocalRecorder};
use crate::server::AppState;
use crate::subscriptions::{RenewalAction, SubscriptionManager};

#[derive(Parser)]
#[command(name = "teams-recorder")]
#[command(about = "Compliance recording call handler for Microsoft Teams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server with subscription renewal and polling fallback
    Serve,

    /// Create a push subscription
    Subscribe {
        /// Graph resource, e.g. communications/callRecords
        #[arg(short, long)]
        resource: String,

        /// Comma separated change types
        #[arg(long, default_value = "created")]
        change_type: String,
    },

    /// List subscriptions owned by the app
    Subscriptions,

    /// Renew this service's subscriptions that are close to expiry
    Renew,

    /// Delete a subscription
    Unsubscribe {
        /// Subscription ID (from `subscriptions` output)
        id: String,
    },

    /// Query call records once and print what was found
    PollOnce,

    /// Print the config file location
    ConfigPath,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Commands::ConfigPath = cli.command {
        let path = match cli.config {
            Some(p) => p,
            None => Config::default_path()?,
        };
        println!("{}", path.display());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    config.validate().context("Invalid configuration")?;
    if matches!(
        cli.command,
        Commands::Serve | Commands::Subscribe { .. } | Commands::Renew
    ) {
        config.ensure_client_state(cli.config.as_deref())?;
    }
    let graph = Arc::new(GraphClient::new(&config)?);

    match cli.command {
        Commands::Serve => {
            serve(config, graph).await?;
        }
        Commands::Subscribe {
            resource,
            change_type,
        } => {
            let change_type = parse_change_types(&change_type);
            anyhow::ensure!(!change_type.is_empty(), "No valid change types given");
            let manager = subscription_manager(&config, graph);
            let sub = manager
                .create(&resource, change_type, config.subscription_ttl(), Utc::now())
                .await?;
            println!(
                "{}  {}  expires {}",
                sub.id.unwrap_or_default(),
                sub.resource,
                sub.expires_at
            );
        }
        Commands::Subscriptions => {
            let subs = graph.list_subscriptions().await?;
            if subs.is_empty() {
                println!("No subscriptions.");
            }
            for sub in subs {
                println!(
                    "{}  {}  [{}]  expires {}  -> {}",
                    sub.id.unwrap_or_default(),
                    sub.resource,
                    models::join_change_types(&sub.change_type),
                    sub.expires_at,
                    sub.notification_url
                );
            }
        }
        Commands::Renew => {
            let manager = subscription_manager(&config, graph.clone());
            let adopted = manager.adopt(graph.list_subscriptions().await?);
            tracing::info!("Tracking {} existing subscriptions", adopted);
            for action in manager.renew_all(Utc::now()).await {
                match action {
                    RenewalAction::Renewed { id, expires_at } => {
                        println!("{}  renewed until {}", id, expires_at)
                    }
                    RenewalAction::Recreated { old_id, new_id } => {
                        println!("{}  recreated as {}", old_id, new_id)
                    }
                    RenewalAction::RecreateFailed { old_id, error } => {
                        println!("{}  recreate failed: {}", old_id, error)
                    }
                    RenewalAction::Failed { id, error } => println!("{}  failed: {}", id, error),
                }
            }
        }
        Commands::Unsubscribe { id } => {
            let manager = subscription_manager(&config, graph);
            manager.delete(&id).await?;
            println!("Deleted subscription {}", id);
        }
        Commands::PollOnce => {
            let poller = polling_service(&config, graph, CancellationToken::new());
            let records = poller.poll_once(Utc::now()).await?;
            if records.is_empty() {
                println!("No call records in the lookback window.");
            }
            for record in records {
                println!(
                    "{}  {}  {:?} - {:?}  [{}]",
                    record.id,
                    record.call_type.as_deref().unwrap_or("unknown"),
                    record.start_date_time,
                    record.end_date_time,
                    record.modalities.join(",")
                );
            }
        }
        Commands::ConfigPath => {}
    }

    Ok(())
}

fn subscription_manager(config: &Config, graph: Arc<GraphClient>) -> SubscriptionManager {
    SubscriptionManager::new(
        graph,
        config.notification_url.clone(),
        config.client_state.clone(),
        config.subscription_ttl(),
        config.renewal_window(),
        config.request_timeout(),
    )
}

fn polling_service(
    config: &Config,
    graph: Arc<GraphClient>,
    shutdown: CancellationToken,
) -> PollingService {
    PollingService::new(
        graph,
        config.polling_interval(),
        config.polling_lookback(),
        config.seen_ttl(),
        config.request_timeout(),
        shutdown,
    )
}

async fn serve(config: Config, graph: Arc<GraphClient>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let timeout = config.request_timeout();

    let recorder = Arc::new(LocalRecorder::new(config.max_concurrent_recordings));
    let orchestrator = ComplianceOrchestrator::new(graph.clone(), recorder, timeout);
    let machine = Arc::new(CallStateMachine::new(
        graph.clone(),
        orchestrator,
        always_answer(),
        timeout,
        config.session_quiet_period(),
    ));
    let polling = Arc::new(polling_service(&config, graph.clone(), shutdown.clone()));
    let subscriptions = Arc::new(
        subscription_manager(&config, graph)
            .with_resources(config.subscription_resources.clone())
            .with_fallback(polling.clone()),
    );

    let results = subscriptions
        .create_batch(&config.subscription_resources, Utc::now())
        .await;
    let created = results.iter().filter(|(_, r)| r.is_ok()).count();
    tracing::info!(
        "Subscribed to {} of {} resources",
        created,
        results.len()
    );
    if config.polling_on_start {
        tracing::info!("Starting call record polling");
        polling.start();
    } else {
        subscriptions.sync_fallback(Utc::now());
    }

    let renewal = tokio::spawn(
        subscriptions
            .clone()
            .run(config.renewal_interval(), shutdown.clone()),
    );
    let eviction = tokio::spawn(
        machine
            .clone()
            .run_eviction(config.eviction_interval(), shutdown.clone()),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
        }
        signal_token.cancel();
    });

    let state = AppState {
        machine,
        subscriptions,
        polling: polling.clone(),
        max_body_bytes: config.max_body_bytes,
    };
    let served = server::serve(config.listen_addr, state, shutdown.clone()).await;

    shutdown.cancel();
    polling.stop();
    let _ = tokio::join!(renewal, eviction);
    served
}
