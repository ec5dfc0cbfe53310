//! End-to-end tour of the queue.
//!
//! Publishes a few jobs, including a debounced one, runs them through a
//! typed job and a plain subscription, and reads the completion stream.
//!
//! This example uses TestContainers to automatically start a PostgreSQL
//! database, so no manual setup is required. Just run:
//!
//! ```bash
//! cargo run --example readme
//! ```

use anyhow::Result;
use jobboss::{BackgroundJob, Boss, BossConfig, Event, PublishOptions, SubscribeOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Example job that sends a welcome email
#[derive(Serialize, Deserialize)]
struct WelcomeEmail {
    user_id: u64,
    address: String,
}

impl BackgroundJob for WelcomeEmail {
    const JOB_NAME: &'static str = "welcome_email";
    const RETRY_LIMIT: Option<i32> = Some(2);
    type Context = ();

    async fn run(&self, _ctx: Self::Context) -> Result<()> {
        info!(user_id = self.user_id, "Sending welcome email to {}", self.address);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

/// Set up a PostgreSQL database using TestContainers
async fn setup_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    info!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&connection_string).await?;
    Ok((pool, container))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,jobboss=debug".into()))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let (pool, _container) = setup_database().await?;
    let config = BossConfig::default()
        .poll_interval(Duration::from_millis(200))
        .monitor_states(Duration::from_secs(1));
    let boss = Boss::with_pool(pool, config)?;
    boss.start().await?;

    let mut events = boss.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::Error(error) => info!("Reported error: {error}"),
                Event::MonitorStates(counts) => info!(total = counts.total, "Job counts"),
                other => info!(?other, "Maintenance"),
            }
        }
    });

    boss.register::<WelcomeEmail>((), SubscribeOptions::default().team_size(2))?;
    boss.subscribe("reports", SubscribeOptions::default(), |job| async move {
        info!(job.id = %job.id, "Building report");
        Ok(Some(json!({ "pages": 3 })))
    })?;
    boss.on_complete("reports", SubscribeOptions::default(), |job| async move {
        if let Some(completion) = job.completion() {
            let completion = completion?;
            info!(
                origin = %completion.request.id,
                state = %completion.state,
                "Report finished with {:?}",
                completion.response
            );
        }
        anyhow::Ok(None)
    })?;

    for user_id in 1..=3 {
        let job = WelcomeEmail {
            user_id,
            address: format!("user{user_id}@example.com"),
        };
        job.enqueue(&boss).await?;
    }

    // Debounced: one publish per two second window runs right away, one more
    // is deferred to the next window, the rest are dropped.
    let debounce = PublishOptions::default()
        .singleton_seconds(2)
        .singleton_next_slot(true);
    for attempt in 1..=3 {
        let id = boss.publish("reports", json!({ "attempt": attempt }), debounce.clone()).await?;
        info!(attempt, ?id, "Published report");
    }

    tokio::time::sleep(Duration::from_secs(6)).await;

    let counts = boss.count_states().await?;
    info!(?counts, "Final job counts");

    boss.stop().await;
    Ok(())
}
