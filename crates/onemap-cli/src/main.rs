use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use onemap_core::ImportBatch;
use onemap_sync::{
    batches_in_range, entity_history, export_parquet, find_duplicates, pole_drop_integrity, revert_report,
    status_distribution, InboxWatcher, OneMapContext, SyncConfig, DEFAULT_ADDRESS_THRESHOLD,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "onemap")]
#[command(about = "OneMap snapshot import and status-history reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one snapshot file.
    Import {
        file: PathBuf,
        #[arg(long)]
        force: bool,
        /// Overrides the date read from the file name (YYYY-MM-DD).
        #[arg(long)]
        snapshot_date: Option<NaiveDate>,
    },
    /// Rebuild history from many snapshot files, oldest first.
    Replay {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    Backup {
        reason: String,
    },
    BackupResume {
        tag: String,
    },
    Backups,
    Restore {
        tag: String,
        /// Confirms that live data will be replaced.
        #[arg(long)]
        yes: bool,
    },
    RestoreResume {
        job_id: String,
    },
    /// Deletes all but the newest N complete backups.
    Prune {
        #[arg(long)]
        keep: usize,
    },
    Report {
        #[command(subcommand)]
        report: ReportCommand,
        #[arg(long, global = true)]
        json: bool,
    },
    Export {
        dir: Option<PathBuf>,
    },
    Migrate,
    /// Imports new files from the inbox, once or on a cron schedule.
    Watch {
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    StatusDistribution,
    Duplicates {
        #[arg(long, default_value_t = DEFAULT_ADDRESS_THRESHOLD)]
        threshold: f64,
    },
    /// Poles over the drop limit and drops wired to several poles.
    PoleDrops,
    History {
        entity_id: String,
    },
    Reverts,
    Batches {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    if let Commands::Migrate = cli.command {
        return OneMapContext::migrate(&config).await;
    }
    let ctx = OneMapContext::from_config(config).await?;

    match cli.command {
        Commands::Import {
            file,
            force,
            snapshot_date,
        } => {
            let batch = ctx.import_file(&file, snapshot_date, force).await?;
            print_batch(&batch);
        }
        Commands::Replay { files, force } => {
            let summary = ctx.replay_files(&files, force).await?;
            for batch in &summary.applied {
                print_batch(batch);
            }
            for file_name in &summary.skipped {
                println!("skipped {file_name}: already imported");
            }
        }
        Commands::Backup { reason } => {
            let manifest = ctx.backups.backup(&reason).await?;
            println!("backup {} complete: {} documents", manifest.tag, manifest.total_copied());
        }
        Commands::BackupResume { tag } => {
            let manifest = ctx.backups.resume_backup(&tag).await?;
            println!("backup {} complete: {} documents", manifest.tag, manifest.total_copied());
        }
        Commands::Backups => {
            for m in ctx.backups.list().await? {
                println!(
                    "{}\t{:?}\t{}\t{} documents\t{}",
                    m.tag,
                    m.state,
                    m.created_at.to_rfc3339(),
                    m.total_copied(),
                    m.reason
                );
            }
        }
        Commands::Restore { tag, yes } => {
            let job = ctx.backups.restore(&tag, yes).await?;
            println!(
                "restore {} from {} done (pre-restore backup {}): {:?}",
                job.job_id, job.backup_tag, job.pre_restore_tag, job.restored
            );
        }
        Commands::RestoreResume { job_id } => {
            let job = ctx.backups.resume_restore(&job_id).await?;
            println!("restore {} from {} done: {:?}", job.job_id, job.backup_tag, job.restored);
        }
        Commands::Prune { keep } => {
            let purged = ctx.backups.prune(keep).await?;
            println!("purged {} backup(s)", purged.len());
            for tag in purged {
                println!("  {tag}");
            }
        }
        Commands::Report { report, json } => run_report(&ctx, report, json).await?,
        Commands::Export { dir } => {
            let dir = dir.unwrap_or_else(|| ctx.config.export_dir.clone());
            let manifest = export_parquet(&ctx.entities, &ctx.ledger, &dir).await?;
            println!("export manifest: {}", manifest.display());
        }
        Commands::Watch { cron, once } => {
            let cron = cron.or_else(|| ctx.config.scheduler_enabled.then(|| ctx.config.import_cron.clone()));
            let watcher = Arc::new(InboxWatcher::new(Arc::new(ctx)));
            match cron {
                Some(cron) if !once => {
                    let mut sched = Arc::clone(&watcher).build_scheduler(&cron).await?;
                    sched.start().await.context("starting scheduler")?;
                    info!(cron = %cron, "watching inbox; ctrl-c to stop");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    sched.shutdown().await.context("stopping scheduler")?;
                }
                _ => {
                    let summary = watcher.run_once().await?;
                    for batch in &summary.imported {
                        print_batch(batch);
                    }
                    for (file_name, reason) in &summary.failed {
                        println!("failed {file_name}: {reason}");
                    }
                    if !summary.failed.is_empty() {
                        anyhow::bail!("{} inbox file(s) could not be imported", summary.failed.len());
                    }
                }
            }
        }
        Commands::Migrate => {}
    }

    Ok(())
}

async fn run_report(ctx: &OneMapContext, report: ReportCommand, json: bool) -> Result<()> {
    let (markdown, value) = match report {
        ReportCommand::StatusDistribution => {
            let r = status_distribution(&ctx.entities).await?;
            (r.to_markdown(), serde_json::to_value(&r)?)
        }
        ReportCommand::Duplicates { threshold } => {
            let r = find_duplicates(&ctx.entities, threshold).await?;
            (r.to_markdown(), serde_json::to_value(&r)?)
        }
        ReportCommand::PoleDrops => {
            let r = pole_drop_integrity(&ctx.entities).await?;
            (r.to_markdown(), serde_json::to_value(&r)?)
        }
        ReportCommand::History { entity_id } => {
            let r = entity_history(&ctx.entities, &entity_id, &ctx.profile.progression())
                .await?
                .with_context(|| format!("entity {entity_id} not found"))?;
            (r.to_markdown(), serde_json::to_value(&r)?)
        }
        ReportCommand::Reverts => {
            let r = revert_report(&ctx.entities, &ctx.profile.progression()).await?;
            (r.to_markdown(), serde_json::to_value(&r)?)
        }
        ReportCommand::Batches { from, to } => {
            let r = batches_in_range(&ctx.ledger, from, to).await?;
            (r.to_markdown(), serde_json::to_value(&r)?)
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{markdown}");
    }
    Ok(())
}

fn print_batch(batch: &ImportBatch) {
    println!(
        "{} {} [{}] records={} new={} changed={} unchanged={} already_applied={} duplicates={} skipped={} invalid={} failed={} validation_rate={:.1}%{}",
        batch.batch_id,
        batch.file_name,
        batch.status.as_str(),
        batch.total_records,
        batch.new_entities,
        batch.status_change_count,
        batch.unchanged_count,
        batch.already_applied,
        batch.duplicate_rows,
        batch.skipped_records,
        batch.invalid_records,
        batch.failed_records,
        batch.validation_rate * 100.0,
        if batch.degraded { " DEGRADED" } else { "" }
    );
}
