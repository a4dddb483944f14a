use anyhow::{bail, Context, Result};
use calsync_reconcile::{maybe_build_scheduler, AppContext, BatchOutcome, ReconcileConfig};
use calsync_storage::pg;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "calsync")]
#[command(about = "Channel calendar reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every active channel mapping once.
    Reconcile,
    /// Reconcile the active mappings of one property.
    Property { property_id: Uuid },
    /// Run the reconciliation cron until interrupted.
    Schedule,
    Serve,
    Migrate,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(true).init();
}

fn print_outcome(label: &str, outcome: &BatchOutcome) {
    println!(
        "{label} complete: mappings={} runs={} skipped={} errors={}",
        outcome.mappings,
        outcome.runs.len(),
        outcome.skipped,
        outcome.errors
    );
    for run in &outcome.runs {
        println!(
            "  {} {} property={} found={} fixed={} divergence={:.2}%",
            run.channel_name,
            run.status,
            run.property_id,
            run.discrepancies_found,
            run.discrepancies_fixed,
            run.divergence_pct
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            let ctx = AppContext::from_env().await?;
            let outcome = ctx.engine.scheduled_reconciliation().await?;
            print_outcome("reconciliation", &outcome);
        }
        Commands::Property { property_id } => {
            let ctx = AppContext::from_env().await?;
            let outcome = ctx.engine.reconcile_property(property_id).await?;
            print_outcome(&format!("property {property_id}"), &outcome);
        }
        Commands::Schedule => {
            let ctx = AppContext::from_env().await?;
            let config = ReconcileConfig {
                scheduler_enabled: true,
                ..ctx.config.clone()
            };
            let Some(mut sched) = maybe_build_scheduler(ctx.engine.clone(), &config).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.reconcile_cron, "reconciliation scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            calsync_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = ReconcileConfig::from_env();
            let pool = pg::connect(&config.database_url).await?;
            pg::migrate(&pool).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
