/*
connected - single-binary main.rs
Starts the Rocket HTTP surface, or runs the news/brief pipelines once when
invoked with --run-news / --run-brief (cron-style usage).
*/

use anyhow::Result;
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use connected::brief::{self, Edition};
use connected::llm::Router;
use connected::pipeline;
use connected::server;
use connected::storage;

#[derive(Parser, Debug)]
#[command(name = "connected", about = "Connected single-binary server + news pipeline")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run the news ingestion pipeline once and exit
    #[arg(long)]
    run_news: bool,

    /// Generate one brief edition and exit
    #[arg(long)]
    run_brief: bool,

    /// Audience for --run-brief
    #[arg(long, default_value = "global")]
    audience: String,

    /// Edition for --run-brief (morning, midday, evening)
    #[arg(long, default_value = "morning")]
    edition: String,

    /// Regenerate the edition even if already produced today
    #[arg(long)]
    force: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths: packaged defaults, then optional override.
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() {
            Some(&default_path)
        } else {
            None
        },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override_path = ?override_path, "configuration loaded");

    let db_pool = match common::init_db_pool(&config.database.path).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %config.database.path, "failed to initialize database pool");
            return Err(e);
        }
    };
    storage::ensure_schema(&db_pool).await?;

    // No usable provider puts synthesis into deterministic-fallback mode;
    // that is a valid configuration, not an error.
    let router = Router::from_config(config.llm.as_ref())?;
    if router.is_none() {
        info!("no completion provider configured; cards use the rule-based fallback");
    }

    if args.run_news {
        let stats = pipeline::run_news_pipeline(&db_pool, &config, router.as_ref()).await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    if args.run_brief {
        let edition: Edition = args.edition.parse()?;
        let stats = brief::run_daily_brief(
            &db_pool,
            &config,
            router.as_ref(),
            &args.audience,
            edition,
            args.force,
        )
        .await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    info!("Launching Rocket HTTP server");
    server::launch_rocket(db_pool, Arc::new(config), router.map(Arc::new)).await
}
