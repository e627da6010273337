use anyhow::{Context, Result};
use clap::Parser;
use coordb::{
    CoordError, CoordinationConfig, CoordinationRegistry, Entity, MemoryStore, UnitOfWork,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "coordb")]
#[command(about = "Concurrent writers contending for one entity through separate units of work")]
struct Cli {
    /// Number of concurrent writers.
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Updates issued by each writer.
    #[arg(long, default_value_t = 5)]
    updates: usize,
    /// JSON file with a `CoordinationConfig`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Entity)]
#[entity(kind = "Agency")]
struct Agency {
    #[entity(key)]
    id: Uuid,
    name: String,
    last_writer: usize,
    revision: u64,
}

coordb::unit_of_work! {
    struct Booking {
        agencies: Agency,
    }
}

#[derive(Debug, Default)]
struct Tally {
    applied: usize,
    retried: usize,
    conflicts: usize,
    other: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coordb=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => CoordinationConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CoordinationConfig::default(),
    };
    let registry = Arc::new(
        CoordinationRegistry::new(Arc::new(MemoryStore::new()), config)
            .context("building coordination registry")?,
    );

    let id = Uuid::new_v4();
    let seed = Booking::new(Arc::clone(&registry))?;
    seed.agencies()
        .save(Agency {
            id,
            name: "Harbour Agency".into(),
            last_writer: 0,
            revision: 0,
        })
        .await
        .context("seeding agency")?;
    info!(%id, workers = cli.workers, updates = cli.updates, "seeded agency");

    let mut writers = Vec::with_capacity(cli.workers);
    for worker in 1..=cli.workers {
        let registry = Arc::clone(&registry);
        let updates = cli.updates;
        writers.push(tokio::spawn(async move {
            run_writer(registry, id, worker, updates).await
        }));
    }

    let mut total = Tally::default();
    for writer in writers {
        let tally = writer.await.context("writer task panicked")??;
        total.applied += tally.applied;
        total.retried += tally.retried;
        total.conflicts += tally.conflicts;
        total.other += tally.other;
    }

    let reader = Booking::new(registry)?;
    let last = reader
        .agencies()
        .get(&id)
        .await?
        .context("agency disappeared")?;
    println!("{}", serde_json::to_string_pretty(&last)?);
    println!(
        "applied={} retried={} conflicts={} other_failures={}",
        total.applied, total.retried, total.conflicts, total.other
    );
    Ok(())
}

async fn run_writer(
    registry: Arc<CoordinationRegistry>,
    id: Uuid,
    worker: usize,
    updates: usize,
) -> Result<Tally> {
    let uow = Booking::new(registry)?;
    let mut tally = Tally::default();
    for _ in 0..updates {
        let Some(mut agency) = uow.agencies().get(&id).await? else {
            anyhow::bail!("agency {id} not found");
        };
        agency.last_writer = worker;
        agency.revision += 1;
        agency.name = format!("Harbour Agency (writer {worker})");

        uow.agencies().enqueue_update(agency);
        match uow.save_changes().await {
            Ok(_) => tally.applied += 1,
            Err(CoordError::ConcurrencyConflict { .. }) => {
                // Reload and push a single update through the retry path.
                tally.conflicts += 1;
                if let Some(mut fresh) = uow.agencies().get(&id).await? {
                    fresh.last_writer = worker;
                    fresh.revision += 1;
                    match uow.agencies().update(fresh).await {
                        Ok(outcome) => {
                            tally.applied += 1;
                            if outcome.attempts > 1 {
                                tally.retried += 1;
                            }
                        }
                        Err(err) if err.is_conflict() => tally.conflicts += 1,
                        Err(_) => tally.other += 1,
                    }
                }
            }
            Err(_) => tally.other += 1,
        }
        tokio::task::yield_now().await;
    }
    Ok(tally)
}
