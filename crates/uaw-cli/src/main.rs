use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uaw_core::WarehouseCounts;
use uaw_pipeline::{
    connect_warehouse, init_logging, ExtractionOutcome, ExtractionStatus, Pipeline,
    PipelineConfig, PromotionOutcome,
};
use uaw_storage::PgWarehouse;

#[derive(Debug, Parser)]
#[command(name = "uaw-cli")]
#[command(about = "User activity warehouse ETL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean the raw log file, quarantine bad records, and stage the rest.
    Extract,
    /// Promote unprocessed staging rows into the marts schema.
    Load,
    /// Extract then load, retrying the load per configuration.
    Run,
    /// Apply the staging and marts migrations.
    Migrate,
    /// Print row counts for staging and marts tables.
    Status,
    /// Run the cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let _log_guards = init_logging(&config.error_log_path, &config.debug_log_path)?;

    let pg = connect_warehouse(&config)
        .await
        .context("failed to connect to the warehouse")?;
    let pipeline = Pipeline::new(config, Arc::new(pg.clone()));
    let result = dispatch(&pipeline, &pg, cli.command.unwrap_or(Commands::Run)).await;
    pipeline.close().await;
    result
}

async fn dispatch(pipeline: &Pipeline, pg: &PgWarehouse, command: Commands) -> Result<()> {
    match command {
        Commands::Migrate => {
            pg.migrate().await?;
            println!("migrations applied");
        }
        Commands::Extract => print_extraction(&pipeline.run_extract().await),
        Commands::Load => print_promotion(&pipeline.run_load().await?),
        Commands::Run => {
            let summary = pipeline.run_cycle().await?;
            print_extraction(&summary.extraction);
            print_promotion(&summary.promotion);
            if summary.load_attempts > 1 {
                println!("load succeeded after {} attempts", summary.load_attempts);
            }
        }
        Commands::Status => print_counts(&pipeline.status().await?),
        Commands::Schedule => {
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                eprintln!("scheduler disabled; set UAW_SCHEDULER_ENABLED=true to run on a cron");
                return Ok(());
            };
            sched
                .start()
                .await
                .context("failed to start scheduler")?;
            println!(
                "scheduler running on `{}`; press Ctrl-C to stop",
                pipeline.config().scheduler.cron
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            sched
                .shutdown()
                .await
                .context("failed to stop scheduler")?;
        }
    }
    Ok(())
}

fn print_extraction(status: &ExtractionStatus) {
    match status {
        ExtractionStatus::Finished(ExtractionOutcome::NoInput) => {
            println!("extract: no input file");
        }
        ExtractionStatus::Finished(ExtractionOutcome::EmptyInput) => {
            println!("extract: input file is empty");
        }
        ExtractionStatus::Finished(ExtractionOutcome::EmptyBatch(report)) => println!(
            "extract: run_id={} total={} staged=0 quarantined={} dropped={} (input kept)",
            report.run_id, report.total, report.quarantined, report.dropped
        ),
        ExtractionStatus::Finished(ExtractionOutcome::Completed(report)) => println!(
            "extract: run_id={} total={} staged={} quarantined={} dropped={} archived_to={}",
            report.run_id,
            report.total,
            report.staged,
            report.quarantined,
            report.dropped,
            report
                .archived_to
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        ),
        ExtractionStatus::Deferred { error } => {
            eprintln!("extract: deferred, input left in place: {error}");
        }
    }
}

fn print_promotion(outcome: &PromotionOutcome) {
    match outcome {
        PromotionOutcome::NothingPending => println!("load: nothing pending"),
        PromotionOutcome::Promoted(report) => {
            println!(
                "load: run_id={} claimed={} new_users={} new_actions={} facts={} marked={} pending={}",
                report.run_id,
                report.claimed,
                report.new_users,
                report.new_actions,
                report.facts_inserted,
                report.marked_processed,
                report.left_pending
            );
            if !report.dq.passed() {
                eprintln!(
                    "load: data quality check found {} facts with null keys",
                    report.dq.null_fact_keys
                );
            }
        }
    }
}

fn print_counts(counts: &WarehouseCounts) {
    println!(
        "staging rows={} unprocessed={} | dim_users={} dim_actions={} facts={}",
        counts.staging_rows,
        counts.unprocessed_rows,
        counts.dim_users,
        counts.dim_actions,
        counts.facts
    );
}
