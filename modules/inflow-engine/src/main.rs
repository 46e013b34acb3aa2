use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use inflow_common::file_config::load_or_default;
use inflow_common::{AppConfig, FileConfig, LedgerEntry, RunStatus, SourceConfig, SourceKind};
use inflow_engine::adapters::{FeedAdapter, HttpContentFetcher};
use inflow_engine::enrichment::ClaudeEnrichment;
use inflow_engine::notify::WebhookNotifier;
use inflow_engine::{AdapterSet, EngineDeps, EngineSettings, RunControl, RunStatusReport, StatusQuery};
use inflow_store::{migrate, MemoryStore, PgStore, SourceRegistry};

#[derive(Parser)]
#[command(name = "inflow", about = "Content ingestion runs")]
struct Cli {
    /// Path to config TOML file (overrides INFLOW_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one ingestion pass to completion
    Run {
        /// Skip AI enrichment for this run
        #[arg(long)]
        no_enrich: bool,
    },
    /// Show a run's status and per-source outcomes (latest run by default)
    Status { run_id: Option<Uuid> },
    /// List recent runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Relabel abandoned running runs as error
    Recover,
    /// Registered sources with their most recent outcome
    Sources,
    /// Register or replace a source
    AddSource {
        #[arg(long)]
        name: String,
        #[arg(long)]
        kind: SourceKind,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Apply the database schema
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("inflow=info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Stores plus collaborators, chosen from the environment.
struct Wiring {
    control: RunControl,
    sources: Arc<dyn SourceRegistry>,
}

async fn wire(config: &AppConfig, file: &FileConfig) -> Result<Wiring> {
    let adapters = AdapterSet::new().with(
        SourceKind::Feed,
        Arc::new(FeedAdapter::new(file.content.user_agent.clone())?),
    );
    let content = Arc::new(HttpContentFetcher::new(
        file.content.user_agent.clone(),
        file.content.max_body_bytes,
    )?);

    let (mut deps, sources): (EngineDeps, Arc<dyn SourceRegistry>) = match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url)
                    .await
                    .context("Failed to connect to Postgres")?,
            );
            migrate(store.pool()).await?;
            (EngineDeps::from_store(store.clone(), adapters, content), store)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store (nothing persists)");
            let store = Arc::new(MemoryStore::new());
            (EngineDeps::from_store(store.clone(), adapters, content), store)
        }
    };

    match &config.anthropic_api_key {
        Some(key) => {
            deps = deps.with_enrichment(Arc::new(ClaudeEnrichment::new(
                key.clone(),
                file.enrichment.model.clone(),
                file.enrichment.max_content_chars,
            )));
        }
        None => warn!("ANTHROPIC_API_KEY not set, enrichment disabled"),
    }

    if let Some(url) = &config.notify_webhook_url {
        deps = deps.with_notifier(Arc::new(WebhookNotifier::new(url.clone())?));
    }

    Ok(Wiring {
        control: RunControl::new(deps, EngineSettings::from(file)),
        sources,
    })
}

fn print_report(report: &RunStatusReport) {
    let run = &report.run;
    println!("Run {}", run.id);
    println!("Status:         {}", run.status);
    println!("Started:        {}", run.started_at);
    if let Some(done) = run.completed_at {
        println!("Completed:      {done}");
    }
    if let Some(msg) = &run.error_message {
        println!("Error:          {msg}");
    }
    println!("Enrichment:     {}", if run.enrichment_enabled { "on" } else { "off" });
    println!("{}", run.counters);
    if report.live {
        println!("Live in this process{}", if report.stop_requested { " (stop requested)" } else { "" });
    }
    if report.orphaned {
        println!("WARNING: marked running but no live worker; `inflow recover` will relabel it once stale");
    }
    for entry in &report.sources {
        println!(
            "  {:<24} {:<8} {:<7} items={:<5} {}",
            entry.source_name,
            entry.kind,
            entry.status.as_str(),
            entry.item_count,
            entry.error_message.as_deref().unwrap_or("")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env();
    init_tracing();
    config.log_redacted();

    let config_path = cli.config.clone().unwrap_or_else(|| config.config_path.clone());
    let file = load_or_default(&config_path)?;

    if let Command::Migrate = cli.command {
        let Some(url) = &config.database_url else {
            bail!("DATABASE_URL must be set to migrate");
        };
        let store = PgStore::connect(url).await.context("Failed to connect to Postgres")?;
        migrate(store.pool()).await?;
        info!("Schema is up to date");
        return Ok(());
    }

    let Wiring { control, sources } = wire(&config, &file).await?;

    match cli.command {
        Command::Run { no_enrich } => {
            let stopper = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    if let Some(run_id) = stopper.live_run_id() {
                        warn!(run_id = %run_id, "Interrupted, stopping at the next checkpoint");
                        stopper.stop_run(run_id);
                    }
                }
            });

            let run = control.run_to_completion(!no_enrich).await?;
            info!("Run complete. {}", run.counters);
            if run.status != RunStatus::Completed {
                bail!(
                    "run {} ended with error: {}",
                    run.id,
                    run.error_message.as_deref().unwrap_or("unknown")
                );
            }
        }
        Command::Status { run_id } => {
            let query = run_id.map(StatusQuery::Run).unwrap_or(StatusQuery::Latest);
            match control.get_status(query).await? {
                Some(report) => print_report(&report),
                None => println!("No runs recorded"),
            }
        }
        Command::Runs { limit } => {
            for run in control.list_recent_runs(limit).await? {
                println!(
                    "{}  {:<9}  {}  sources={}/{}  new={}  enriched={}",
                    run.id,
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.counters.success_sources,
                    run.counters.total_sources,
                    run.counters.new_items,
                    run.counters.enriched_count,
                );
            }
        }
        Command::Recover => {
            let swept = control.recover_stale_runs().await?;
            println!("Relabelled {} stale run(s)", swept.len());
        }
        Command::Sources => {
            let latest: HashMap<String, LedgerEntry> = control
                .source_summaries()
                .await?
                .into_iter()
                .map(|entry| (entry.source_name.clone(), entry))
                .collect();
            for source in sources.all_sources().await? {
                let last = match latest.get(&source.name) {
                    Some(entry) => format!(
                        "{:<7} items={:<5} at {}  {}",
                        entry.status.as_str(),
                        entry.item_count,
                        entry.completed_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.error_message.as_deref().unwrap_or("")
                    ),
                    None => "never collected".to_string(),
                };
                println!(
                    "{:<24} {:<8} {:<3} total={:<6} {}",
                    source.name,
                    source.kind,
                    if source.enabled { "on" } else { "off" },
                    source.total_items_collected,
                    last
                );
            }
        }
        Command::AddSource {
            name,
            kind,
            url,
            priority,
        } => {
            let mut source = SourceConfig::new(name, kind).with_priority(priority);
            source.url = url;
            sources.register_source(&source).await?;
            info!(source = %source.name, kind = %source.kind, "Source registered");
        }
        // Applied before wiring.
        Command::Migrate => {}
    }

    Ok(())
}
