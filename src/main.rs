use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod aggregate;
mod bus;
mod config;
mod features;
mod inference;
mod insight;
mod llm;
mod models;
mod nodes;
mod pipeline;
mod recommend;
mod report;
mod segment;
mod simulator;
mod store;

use bus::{EventBus, LogBus, WebhookBus};
use config::Config;
use inference::{HttpInferenceEndpoint, InferenceAdapter};
use llm::{ChatCompletionClient, CompletionService, LlmRouter};
use models::{AnalysisResult, EntityKind};
use pipeline::{EntityOutcome, Pipeline};
use store::{EntityStore, PgStore};

#[derive(Parser)]
#[command(name = "marketplace-health")]
#[command(about = "Event-driven health pipeline for the tutoring marketplace", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed entities
    Seed,
    /// Generate synthetic events and run them through aggregation
    Simulate {
        #[arg(long, default_value_t = 25)]
        events: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Import historical events from a CSV file
    Ingest {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Refresh predictions for one entity, or for every entity when no id
    /// is given
    Analyze {
        #[arg(long)]
        entity_id: Option<String>,
        #[arg(long, value_enum, default_value_t = EntityKind::Student)]
        entity_type: EntityKind,
    },
    /// Generate a markdown report from stored segments and insights
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));

    match cli.command {
        Commands::InitDb => {
            store.init().await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            store::seed(store.as_ref(), Utc::now()).await?;
            println!("Seed entities inserted.");
        }
        Commands::Simulate { events, seed } => {
            let bus = build_bus(&config)?;
            let llm = build_llm(&config)?;
            let mut rng = simulator::rng_from_seed(seed);
            let mut sent = 0usize;

            for _ in 0..events {
                let event = simulator::generate_event(&mut rng, Utc::now());
                match aggregate::process_event(store.as_ref(), bus.as_ref(), &event).await {
                    Ok(alerts) => {
                        if let Some(llm) = &llm {
                            aggregate::enrich_alerts(store.as_ref(), llm, &alerts).await;
                        }
                        sent += 1;
                    }
                    Err(error) => warn!(%error, "failed to process simulated event"),
                }
            }

            println!("Simulated {sent} events.");
        }
        Commands::Ingest { csv } => {
            let bus = build_bus(&config)?;
            let llm = build_llm(&config)?;
            let processed =
                aggregate::ingest_csv(store.as_ref(), bus.as_ref(), llm.as_ref(), &csv).await?;
            println!("Processed {processed} events from {}.", csv.display());
        }
        Commands::Analyze {
            entity_id,
            entity_type,
        } => {
            let pipeline = build_pipeline(&config, store.clone())?;

            match entity_id {
                Some(id) => match pipeline.process_entity(&id, entity_type).await? {
                    EntityOutcome::NotFound => {
                        println!("Entity {id} ({entity_type}) not found.");
                    }
                    EntityOutcome::Processed(result) => print_result(&result),
                },
                None => {
                    for outcome in pipeline.run_all().await? {
                        let summary = &outcome.summary;
                        println!(
                            "{}: {} processed (avg churn {:.2}, avg health {:.1})",
                            summary.entity_type,
                            summary.processed,
                            summary.avg_churn_risk,
                            summary.avg_health_score,
                        );
                        for (segment, count) in &summary.segments {
                            println!("  {segment}: {count}");
                        }
                    }
                }
            }
        }
        Commands::Report { out } => {
            let segments = store.list_segments().await?;
            let insights = store.list_recent_insights(50).await?;
            let report = report::build_report(&segments, &insights, Utc::now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn build_bus(config: &Config) -> anyhow::Result<Arc<dyn EventBus>> {
    match &config.event_bus_url {
        Some(url) => Ok(Arc::new(WebhookBus::new(
            url.clone(),
            config.event_bus_name.clone(),
        )?)),
        None => Ok(Arc::new(LogBus)),
    }
}

fn build_llm(config: &Config) -> anyhow::Result<Option<LlmRouter>> {
    let primary: Option<Arc<dyn CompletionService>> = match &config.llm_url {
        Some(url) => Some(Arc::new(ChatCompletionClient::new(
            url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )?)),
        None => None,
    };
    let fallback: Option<Arc<dyn CompletionService>> = match &config.llm_fallback_url {
        Some(url) => Some(Arc::new(ChatCompletionClient::new(
            url.clone(),
            config.llm_fallback_api_key.clone(),
            config.llm_fallback_model.clone(),
        )?)),
        None => None,
    };

    if primary.is_none() && fallback.is_none() {
        return Ok(None);
    }
    Ok(Some(LlmRouter::new(primary, fallback)))
}

fn build_pipeline(config: &Config, store: Arc<PgStore>) -> anyhow::Result<Pipeline> {
    let inference = match &config.inference_url {
        Some(url) => InferenceAdapter::new(
            Arc::new(HttpInferenceEndpoint::new(url.clone())?),
            "marketplace-health-endpoint",
        ),
        None => InferenceAdapter::unconfigured("marketplace-health-endpoint"),
    };

    let classifier = match &config.classifier_url {
        Some(url) => InferenceAdapter::new(
            Arc::new(HttpInferenceEndpoint::new(url.clone())?),
            "fabric-risk-classifier",
        ),
        None => InferenceAdapter::unconfigured("fabric-risk-classifier"),
    };

    Ok(Pipeline::new(
        store,
        build_bus(config)?,
        inference,
        classifier,
        build_llm(config)?.unwrap_or_else(LlmRouter::unconfigured),
        config.model_version.clone(),
        config.batch_size,
    ))
}

fn print_result(result: &AnalysisResult) {
    match result {
        AnalysisResult::Marketplace(r) => {
            println!(
                "{} ({}) segment {} churn_14d {:.2} health {:.1}",
                r.entity_id,
                r.entity_type,
                r.segment,
                r.prediction.churn_risk_14d,
                r.prediction.health_score,
            );
            for recommendation in &r.recommendations {
                println!("  - {recommendation}");
            }
        }
        AnalysisResult::Node(r) => {
            println!(
                "{} risk {}/100 ({}) via {}",
                r.entity_id,
                r.risk_score,
                r.band.label(),
                r.source,
            );
            for recommendation in &r.recommendations {
                println!("  - {recommendation}");
            }
        }
    }
}
