use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;
use vep_core::VehicleIdentity;
use vep_pipeline::{EnhancementPipeline, PipelineConfig};
use vep_store::{EnhancementStateStore, MemoryEnhancementStore, PgEnhancementStore};

#[derive(Debug, Parser)]
#[command(name = "vep-cli")]
#[command(about = "Vehicle enhancement pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one enhancement pass for the identity given on the command line.
    Enhance {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        make: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        trim: Option<String>,
        #[arg(long)]
        vin: Option<String>,
    },
    /// Start the JSON API server.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Enhance {
            year,
            make,
            model,
            trim,
            vin,
        } => {
            let identity = VehicleIdentity {
                year: Some(year),
                make: Some(make),
                model: Some(model),
                trim,
                vin,
            };
            let config = PipelineConfig::from_env();
            let store: Arc<dyn EnhancementStateStore> = match std::env::var("DATABASE_URL") {
                Ok(database_url) => {
                    let store = PgEnhancementStore::connect(&database_url).await?;
                    store.ensure_schema().await?;
                    Arc::new(store)
                }
                Err(_) => Arc::new(MemoryEnhancementStore::new()),
            };
            let pipeline = EnhancementPipeline::from_config(&config, store)?;
            let vehicle_id = Uuid::new_v4();
            let summary = pipeline.run(vehicle_id, &identity).await?;
            println!(
                "enhancement complete: vehicle_id={} status={:?} completed={}/{}",
                vehicle_id,
                summary.overall_status,
                summary.categories_completed,
                summary.total_categories
            );
        }
        Commands::Serve => {
            vep_web::serve_from_env().await?;
        }
    }

    Ok(())
}
