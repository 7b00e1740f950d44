use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use api::registry::QueueRegistry;
use api::service::QueueServiceImpl;
use clap::Parser;
use domain::ordering::PriorityPolicy;
use infrastructure::nats::{
    NATSBroadcaster, NATSCalendarProvider, NATSIdentityProvider, NATSPresence, NATSRPC,
};
use infrastructure::postgres::{PgHelpedRepository, PgSnapshotRepository};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

mod api;
mod config;
mod domain;
mod infrastructure;

const RPC_SUBJECT: &str = "ohqueue.rpc";
const PRESENCE_SUBJECT: &str = "ohqueue.presence";

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::parse();

    config::configure_tracing();

    info!(env = %config.env, queues_file = %config.queues_file, "Starting");

    let definitions = config::load_queues(&config.queues_file)?;

    let pool = PgPoolOptions::new().connect(&config.database_url).await?;
    let nc = async_nats::connect(&config.nats_url)
        .await
        .map_err(|e| anyhow!("connect to {}: {}", config.nats_url, e))?;

    let registry = Arc::new(QueueRegistry::new(
        definitions,
        PriorityPolicy {
            urgency_weight: config.urgency_weight,
        },
    ));

    let service = QueueServiceImpl::new(
        registry,
        PgSnapshotRepository::new(pool.clone()),
        PgHelpedRepository::new(pool),
        NATSBroadcaster::new(nc.clone()),
        NATSIdentityProvider::new(nc.clone(), config.identity_subject.clone()),
        NATSCalendarProvider::new(nc.clone(), config.calendar_subject.clone()),
    );

    service.restore_all().await;
    service.refresh_calendar().await;

    let saver = service.clone();
    let save_every = Duration::from_secs(config.save_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(save_every);
        loop {
            ticks.tick().await;
            saver.save_changed().await;
        }
    });

    let refresher = service.clone();
    let refresh_every = Duration::from_secs(config.calendar_refresh_secs.max(1));
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(refresh_every);
        // The first tick fires immediately and startup already refreshed.
        ticks.tick().await;
        loop {
            ticks.tick().await;
            refresher.refresh_calendar().await;
        }
    });

    let rpc = NATSRPC::new(nc.clone(), RPC_SUBJECT.to_string());
    let presence = NATSPresence::new(nc, PRESENCE_SUBJECT.to_string());

    tokio::select! {
        result = presence.listen(service.clone()) => {
            error!("Presence listener exited: {:?}", result);
        }
        result = rpc.listen(service) => {
            error!("RPC listener exited: {:?}", result);
        }
    }

    info!("Exiting");

    Ok(())
}
