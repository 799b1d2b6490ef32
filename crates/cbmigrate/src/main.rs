//! cbmigrate CLI
//!
//! Migrates documents and indexes from MongoDB or DynamoDB into Couchbase.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cbmigrate::{MigrationConfig, Pipeline};

#[derive(Parser)]
#[command(name = "cbmigrate")]
#[command(version)]
#[command(about = "Migrate documents and indexes from MongoDB or DynamoDB to Couchbase", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CBMIGRATE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Documents per destination batch
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Skip index migration
    #[arg(long, global = true)]
    no_indexes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migration from config file
    Run {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Generate example configuration
    Init {
        /// Source type (mongodb, dynamodb)
        #[arg(short, long)]
        source: String,

        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,
    },
}

/// Command-line overrides applied on top of the configuration file.
struct Overrides {
    batch_size: Option<usize>,
    no_indexes: bool,
}

impl Overrides {
    fn apply(&self, config: &mut MigrationConfig) {
        if let Some(batch_size) = self.batch_size {
            config.destination.batch_size = batch_size;
        }
        if self.no_indexes {
            config.options.copy_indexes = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let overrides = Overrides {
        batch_size: cli.batch_size,
        no_indexes: cli.no_indexes,
    };

    match cli.command {
        Some(Commands::Run { config }) => run_migration(&config, &overrides).await?,
        Some(Commands::Validate { config }) => validate_config(&config, &overrides)?,
        Some(Commands::Init { source, output }) => generate_config(&source, &output)?,
        None => {
            let Some(config) = cli.config else {
                anyhow::bail!(
                    "no configuration given. Usage: cbmigrate --config <FILE> or cbmigrate <COMMAND>"
                );
            };
            run_migration(&config, &overrides).await?;
        }
    }

    Ok(())
}

fn load_config(config_path: &Path, overrides: &Overrides) -> anyhow::Result<MigrationConfig> {
    info!("Loading configuration from {:?}", config_path);
    let mut config = MigrationConfig::from_file(config_path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn run_migration(config_path: &Path, overrides: &Overrides) -> anyhow::Result<()> {
    let config = load_config(config_path, overrides)?;

    info!(
        "Migrating {} into {}",
        config.source.type_name(),
        config.destination.keyspace()
    );

    let mut pipeline = Pipeline::new(&config)?;
    let stats = pipeline.run().await?;

    println!("\n✅ Migration Complete!");
    println!("   Documents:  {}", stats.documents);
    println!("   Batches:    {}", stats.batches);
    if config.options.copy_indexes {
        println!(
            "   Indexes:    {} created, {} skipped, {} failed",
            stats.indexes_created, stats.indexes_skipped, stats.indexes_failed
        );
    }
    println!("   Duration:   {:.2}s", stats.duration_secs);
    println!("   Throughput: {:.0} docs/sec", stats.throughput());

    Ok(())
}

fn validate_config(config_path: &Path, overrides: &Overrides) -> anyhow::Result<()> {
    let config = load_config(config_path, overrides)?;

    println!("✅ Configuration is valid!");
    println!("   Source:      {}", config.source.type_name());
    println!("   Destination: {}", config.destination.keyspace());
    println!(
        "   Key:         {}",
        config
            .destination
            .generated_key
            .as_deref()
            .unwrap_or("natural key of the source")
    );
    println!("   Batch size:  {}", config.destination.batch_size);

    Ok(())
}

fn generate_config(source: &str, output: &Path) -> anyhow::Result<()> {
    let template = match source.to_lowercase().as_str() {
        "mongodb" => MONGODB_TEMPLATE,
        "dynamodb" => DYNAMODB_TEMPLATE,
        _ => anyhow::bail!("unknown source type {}. Supported sources: mongodb, dynamodb", source),
    };

    std::fs::write(output, template)?;
    println!("✅ Generated configuration: {:?}", output);
    println!("   Edit the file and run: cbmigrate run --config {:?}", output);

    Ok(())
}

const MONGODB_TEMPLATE: &str = r#"# cbmigrate configuration - MongoDB source
source:
  type: mongodb
  data_api_url: https://data.mongodb-api.com/app/<app-id>/endpoint/data/v1
  api_key: your-data-api-key
  data_source: mongodb-atlas
  database: your_database
  collection: your_collection
  page_size: 1000
  # filter: { "status": "active" }

destination:
  management_url: http://localhost:8091
  query_url: http://localhost:8093
  username: Administrator
  password: password
  bucket: your_bucket
  scope: _default
  collection: your_collection
  # generated_key: "prefix::%_id%"   # %field%, #UUID# and literal text
  # hash_document_key: sha256         # sha256 or sha512
  keep_primary_key: false
  batch_size: 250

options:
  copy_indexes: true
  buffer_size: 10000
  index_sample_size: 100
  max_retries: 3
"#;

const DYNAMODB_TEMPLATE: &str = r#"# cbmigrate configuration - DynamoDB source
# table_description: output of `aws dynamodb describe-table --table-name <table>`
# items: JSON lines export, one {"Item": {...}} per line
source:
  type: dynamodb
  table_description: ./table.json
  items: ./items.json

destination:
  management_url: http://localhost:8091
  query_url: http://localhost:8093
  username: Administrator
  password: password
  bucket: your_bucket
  scope: _default
  collection: your_table
  # generated_key: "%pk%::%sk%"
  batch_size: 250

options:
  copy_indexes: true
  buffer_size: 10000
"#;
