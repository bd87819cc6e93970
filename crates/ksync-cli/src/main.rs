use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ksync_core::{MappingType, SyncKind};
use ksync_storage::{MemoryStore, PgStore, SyncStore};
use ksync_sync::{build_scheduler, import_registry, SyncConfig, SyncPipeline};
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ksync")]
#[command(about = "Synchronize external sources into per-source tables and map their values")]
struct Cli {
    /// Run against an in-memory store seeded from the source registry.
    #[arg(long, global = true)]
    dry_run: bool,
    /// Recorded as the initiator in sync logs and mappings.
    #[arg(long, global = true, env = "KSYNC_ACTOR", default_value = "CLI")]
    actor: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one source, or every active source when --source is omitted.
    Sync {
        #[arg(long)]
        source: Option<i64>,
        /// Only fetch rows submitted after the last successful sync.
        #[arg(long)]
        incremental: bool,
    },
    /// Re-run value mapping for a source.
    Resolve {
        #[arg(long)]
        source: i64,
    },
    /// List values that could not be mapped, with suggestions.
    Unmapped {
        #[arg(long)]
        source: i64,
    },
    /// Record a manual alias.
    Map {
        #[arg(long = "type", value_parser = parse_mapping_type)]
        mapping_type: MappingType,
        #[arg(long)]
        value: String,
        #[arg(long)]
        canonical: String,
        /// Apply the alias to this source's rows right away.
        #[arg(long)]
        apply_to: Option<i64>,
    },
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },
    Logs {
        #[arg(long)]
        source: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Migrate,
    /// Start the admin API (and the scheduler when enabled).
    Serve,
    /// Run scheduled incremental syncs until interrupted.
    Schedule,
}

#[derive(Debug, Subcommand)]
enum SourcesAction {
    List,
    Import {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    Enable {
        id: i64,
    },
    Disable {
        id: i64,
    },
}

fn parse_mapping_type(raw: &str) -> Result<MappingType, String> {
    MappingType::parse(raw).ok_or_else(|| format!("expected STORE or PERSON, got {raw:?}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("KSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

async fn open_store(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn SyncStore>> {
    if dry_run {
        let store = Arc::new(MemoryStore::new());
        if config.sources_file.exists() {
            import_registry(store.as_ref(), &config.sources_file, "DRY_RUN").await?;
        } else {
            warn!(path = %config.sources_file.display(), "no source registry; dry run starts empty");
        }
        return Ok(store);
    }
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

/// `Ok(false)` means the command ran but something it covers failed.
async fn run(cli: Cli) -> Result<bool> {
    let config = SyncConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Sync {
        source: None,
        incremental: false,
    });
    let store = open_store(&config, cli.dry_run).await?;
    let pipeline = Arc::new(SyncPipeline::new(config.clone(), store.clone())?);
    let actor = cli.actor.as_str();

    match command {
        Commands::Sync { source: Some(id), incremental } => {
            let kind = if incremental {
                SyncKind::Incremental
            } else {
                SyncKind::Manual
            };
            print_json(&pipeline.sync_source(id, kind, actor).await?)?;
        }
        Commands::Sync { source: None, incremental } => {
            let summary = if incremental {
                pipeline.incremental_sync(actor).await?
            } else {
                pipeline.full_sync(actor).await?
            };
            print_json(&summary)?;
            return Ok(summary.is_success());
        }
        Commands::Resolve { source } => {
            print_json(&pipeline.resolver().resolve_mappings(source).await?)?;
        }
        Commands::Unmapped { source } => {
            print_json(&pipeline.resolver().unmapped_report(source).await?)?;
        }
        Commands::Map {
            mapping_type,
            value,
            canonical,
            apply_to,
        } => {
            let resolver = pipeline.resolver();
            let mapping = resolver
                .set_manual_mapping(mapping_type, &value, &canonical, actor)
                .await?;
            print_json(&mapping)?;
            if let Some(source_id) = apply_to {
                let rows = resolver.apply_manual_mapping(source_id, mapping_type, &value).await?;
                info!(source_id, rows, "applied manual mapping");
            }
        }
        Commands::Sources { action } => match action {
            SourcesAction::List => print_json(&store.list_sources(false).await?)?,
            SourcesAction::Import { file } => {
                let path = file.unwrap_or_else(|| config.sources_file.clone());
                print_json(&import_registry(store.as_ref(), &path, actor).await?)?;
            }
            SourcesAction::Enable { id } => pipeline.set_source_active(id, true).await?,
            SourcesAction::Disable { id } => pipeline.set_source_active(id, false).await?,
        },
        Commands::Logs { source, limit } => {
            print_json(&pipeline.recent_sync_logs(source, limit.max(1)).await?)?;
        }
        Commands::Migrate => {
            info!(dry_run = cli.dry_run, "migrations up to date");
        }
        Commands::Serve => {
            let scheduler = build_scheduler(pipeline.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }
            ksync_web::serve(pipeline, &config.bind).await?;
        }
        Commands::Schedule => {
            let Some(mut sched) = build_scheduler(pipeline).await? else {
                bail!("scheduler is disabled; set KSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; waiting for ctrl-c");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from(["ksync", "--dry-run", "sync", "--source", "3", "--incremental"]).unwrap();
        assert!(cli.dry_run);
        assert!(matches!(
            cli.command,
            Some(Commands::Sync {
                source: Some(3),
                incremental: true
            })
        ));
    }

    #[test]
    fn map_requires_a_known_type() {
        let ok = Cli::try_parse_from([
            "ksync", "map", "--type", "store", "--value", "Escazu", "--canonical", "S01",
        ])
        .unwrap();
        assert!(matches!(
            ok.command,
            Some(Commands::Map {
                mapping_type: MappingType::Store,
                ..
            })
        ));
        assert!(Cli::try_parse_from([
            "ksync", "map", "--type", "vendor", "--value", "x", "--canonical", "y",
        ])
        .is_err());
    }
}
