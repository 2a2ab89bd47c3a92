//! lightcrud CLI - inspect and query an entity store from the shell

use clap::{Parser, Subcommand};
use lightcrud::config::{self, EngineConfig};
use lightcrud::query::{Filter, FindOptions};
use lightcrud::schema::{load_schema, Registry};
use lightcrud::{Database, EntityManager, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "lightcrud")]
#[command(version)]
#[command(about = "Lightweight entity mapper over SQLite")]
#[command(long_about = r#"
lightcrud keeps typed entities in a SQLite store described by a TOML schema.

Example usage:
  lightcrud init-config --database shows.db
  lightcrud verify --schema schema.toml
  lightcrud find --schema schema.toml --entity Episode --filter '{"Serie": {"name": "Lost"}}'
  lightcrud exec --sql "SELECT COUNT(*) FROM Episodes WHERE watched = ?" --param 1
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides the config file)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with default settings
    InitConfig {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Create missing tables, run pending migrations, create missing indexes
    Verify {
        /// Path to the schema file
        #[arg(short, long)]
        schema: PathBuf,
    },

    /// Run a raw SQL statement
    Exec {
        /// SQL text with `?` placeholders
        #[arg(long)]
        sql: String,

        /// Parameter values, as JSON (bare words are taken as text)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Find entities matching a JSON filter
    Find {
        #[arg(short, long)]
        schema: PathBuf,

        /// Entity type name
        #[arg(short, long)]
        entity: String,

        /// Filter object, e.g. '{"watched": 1}'
        #[arg(short, long, default_value = "{}")]
        filter: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<u32>,

        /// ORDER BY clause
        #[arg(long)]
        order_by: Option<String>,
    },

    /// Count entities matching a JSON filter
    Count {
        #[arg(short, long)]
        schema: PathBuf,

        #[arg(short, long)]
        entity: String,

        #[arg(short, long, default_value = "{}")]
        filter: String,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE))
}

fn engine_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::load(&config_path(cli))?;
    if let Some(database) = &cli.database {
        config = config.with_database(database);
    }
    config.prepare_storage()?;
    Ok(config)
}

async fn open_manager(config: &EngineConfig, schema: &Path) -> anyhow::Result<EntityManager> {
    let registry: Registry = load_schema(schema)?.into_registry()?;
    Ok(EntityManager::open(config, registry).await?)
}

fn parse_param(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = engine_config(&cli)?;

    match &cli.command {
        Commands::InitConfig { force } => {
            let path = config_path(&cli);
            config.save(&path, *force)?;
            tracing::info!("Wrote config to {}", path.display());
        }

        Commands::Verify { schema } => {
            let registry: Registry = load_schema(schema)?.into_registry()?;
            let manager = EntityManager::new(Database::open(&config)?, registry, &config);
            let report = manager.verify_tables().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Exec { sql, params } => {
            let db = Database::open(&config)?;
            let params = params.iter().map(|p| parse_param(p)).collect();
            let rows = db.execute(sql.as_str(), params).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }

        Commands::Find {
            schema,
            entity,
            filter,
            limit,
            order_by,
        } => {
            let manager = open_manager(&config, schema).await?;
            let json: serde_json::Value = serde_json::from_str(filter)?;
            let filter = Filter::from_json(manager.registry(), entity, &json)?;
            let options = FindOptions {
                limit: *limit,
                order_by: order_by.clone(),
                ..Default::default()
            };

            let found = manager.find(entity, &filter, &options).await?;
            let rendered: Vec<serde_json::Value> = found.iter().map(|e| e.to_json()).collect();
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }

        Commands::Count { schema, entity, filter } => {
            let manager = open_manager(&config, schema).await?;
            let json: serde_json::Value = serde_json::from_str(filter)?;
            let filter = Filter::from_json(manager.registry(), entity, &json)?;
            let count = manager.count(entity, &filter).await?;
            println!("{}", serde_json::json!({ "entity": entity, "count": count }));
        }
    }

    Ok(())
}
