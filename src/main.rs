use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use hoster::api::{self, ApiState};
use hoster::commands::{CommandBus, CommandContext};
use hoster::orchestrator::agent::AGENT_VERSION;
use hoster::proxy::{self, ProxyState};
use hoster::store::db::Db;
use hoster::store::entities;
use hoster::workers::billing::{self, BillingReporter};
use hoster::workers::dns::DnsVerifier;
use hoster::workers::health::HealthChecker;
use hoster::workers::invoices::InvoiceGenerator;
use hoster::workers::provisioner::Provisioner;
use hoster::{Config, Engine, HostPool, SecretBox};

#[derive(Parser)]
#[command(name = "hoster")]
#[command(about = "Multi-tenant container deployment platform", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API server, reverse proxy, and background workers
    Serve,

    /// Print the agent protocol version this server expects
    AgentVersion,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoster=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve => serve().await,
        Command::AgentVersion => {
            println!("{AGENT_VERSION}");
            Ok(())
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    let schemas = entities::registry();
    let db = Db::open(&config.database_path(), &schemas)
        .await
        .context("failed to open database")?;
    let crypto = SecretBox::new(&config.encryption_key)?;

    let (events, events_rx) = billing::event_channel();
    let engine = Arc::new(Engine::new(
        db.clone(),
        schemas,
        crypto.clone(),
        Some(events.clone()),
    ));
    let pool = Arc::new(HostPool::new(db.clone(), crypto, config.clone()));

    engine.set_bus(Arc::new(CommandBus::new(CommandContext {
        engine: engine.clone(),
        pool: pool.clone(),
        config: config.clone(),
        events: Some(events),
    })));

    let cancel = CancellationToken::new();

    tokio::spawn(HealthChecker::new(engine.clone()).run(cancel.child_token()));
    tokio::spawn(InvoiceGenerator::new(engine.clone()).run(cancel.child_token()));
    tokio::spawn(Provisioner::new(engine.clone()).run(cancel.child_token()));
    tokio::spawn(BillingReporter::new(config.clone(), events_rx).run(cancel.child_token()));
    match DnsVerifier::new(engine.clone()) {
        Ok(verifier) => {
            tokio::spawn(verifier.run(cancel.child_token()));
        }
        Err(err) => warn!(error = %err, "dns verifier disabled"),
    }

    let api_state = Arc::new(ApiState {
        engine: engine.clone(),
        pool: pool.clone(),
    });
    let proxy_state = Arc::new(ProxyState {
        db,
        pool: pool.clone(),
        config: config.clone(),
    });

    let mut api_task = tokio::spawn(api::run(api_state, config.api_port, cancel.child_token()));
    let mut proxy_task = tokio::spawn(proxy::run(proxy_state, cancel.child_token()));

    // Either server exiting early (a bind failure, most likely) tears
    // the whole process down; otherwise wait for the signal.
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cancel.cancel();
            let _ = api_task.await;
            let _ = proxy_task.await;
            Ok(())
        }
        result = &mut api_task => {
            cancel.cancel();
            let _ = proxy_task.await;
            result.context("api server task panicked")?.map_err(Into::into)
        }
        result = &mut proxy_task => {
            cancel.cancel();
            let _ = api_task.await;
            result.context("proxy task panicked")?.map_err(Into::into)
        }
    };

    pool.close_all().await;
    info!("shutdown complete");
    outcome
}
