//! Streaming mosaic pipeline operator CLI.
//!
//! Subcommands:
//!   run --once | --loop [--sleep SECS]   scheduler ticks
//!   register-bpcal NAME,RA,DEC           bind a bandpass calibrator
//!   reprocess GROUP_ID                   reset a group to pending
//!   status [GROUP_ID]                    operator triage view
//!
//! Exit codes: 0 success, 1 recoverable (no group advanced), 2 configuration
//! or permissions error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use skymosaic_backend::catalog::CalibratorCatalog;
use skymosaic_backend::config::PipelineConfig;
use skymosaic_backend::external::command::{
    CommandApplier, CommandConverter, CommandImager, CommandMosaicker, CommandPhotometry,
    CommandSolver,
};
use skymosaic_backend::external::data_registry::SqliteDataRegistry;
use skymosaic_backend::external::Collaborators;
use skymosaic_backend::organizer::FileOrganizer;
use skymosaic_backend::recovery::FailureLedger;
use skymosaic_backend::registry::CalibrationRegistry;
use skymosaic_backend::runner::{BreakerRegistry, StageRunner};
use skymosaic_backend::scheduler::{Scheduler, TickOutcome};
use skymosaic_backend::store::StateStore;
use skymosaic_backend::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "skymosaic")]
#[command(about = "Streaming mosaic orchestrator for drift-scan interferometer data")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute scheduler ticks
    Run {
        /// Execute a single tick and exit
        #[arg(long)]
        once: bool,

        /// Run continuously until interrupted
        #[arg(long = "loop")]
        continuous: bool,

        /// Poll interval override in seconds for --loop
        #[arg(long)]
        sleep: Option<u64>,
    },

    /// Register a bandpass calibrator: NAME,RA_DEG,DEC_DEG
    RegisterBpcal {
        binding: String,

        /// Declination half-range covered by this calibrator
        #[arg(long, default_value_t = 5.0)]
        dec_tol: f64,
    },

    /// Reset a group to pending and bump its retry counter
    Reprocess { group_id: String },

    /// Show group state and recent failures
    Status { group_id: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn execute(cli: Cli) -> Result<u8> {
    let mut config = load_config(&cli)?;
    if let Command::Run {
        sleep: Some(secs), ..
    } = &cli.command
    {
        config.scheduler.poll_interval_secs = *secs;
    }
    let config = Arc::new(config);

    let store = Arc::new(StateStore::open(&config.paths.state_db_path())?);
    let registry = Arc::new(CalibrationRegistry::new(store.clone()));
    let catalog = Arc::new(CalibratorCatalog::new(store.clone(), config.catalog.clone()));
    let organizer = Arc::new(FileOrganizer::new(
        config.paths.ms_root.clone(),
        store.clone(),
    ));

    match cli.command {
        Command::Run {
            once, continuous, ..
        } => {
            let collab = build_collaborators(&config)?;
            let breakers = Arc::new(BreakerRegistry::new(config.stages.clone()));
            let runner = Arc::new(StageRunner::new(
                config.stages.clone(),
                breakers,
                FailureLedger::new(store.clone()),
            ));
            let orchestrator = Arc::new(Orchestrator::new(
                config.clone(),
                store.clone(),
                registry.clone(),
                catalog,
                organizer.clone(),
                runner,
                collab,
            ));
            let scheduler = Scheduler::new(config, store, orchestrator, organizer, registry);
            scheduler.startup()?;

            if continuous {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received, shutting down after current tick");
                        let _ = shutdown_tx.send(true);
                    }
                });
                scheduler.run_loop(shutdown_rx).await?;
                Ok(0)
            } else {
                // Default is a single tick; --once makes it explicit.
                let _ = once;
                match scheduler.tick().await? {
                    TickOutcome::Idle => {
                        info!("nothing to do");
                        Ok(1)
                    }
                    outcome => {
                        info!(?outcome, "tick finished");
                        Ok(0)
                    }
                }
            }
        }

        Command::RegisterBpcal { binding, dec_tol } => {
            let (name, ra_deg, dec_deg) = parse_bpcal_arg(&binding)?;
            catalog
                .register(&name, ra_deg, dec_deg, dec_tol, Some("operator".into()))
                .map_err(|e| anyhow::anyhow!("register calibrator: {e}"))?;

            // Report the next transit so the operator can sanity-check the
            // binding against the observing schedule.
            let now_mjd = Utc::now().timestamp() as f64 / 86_400.0 + 40_587.0;
            let transit = config
                .observatory
                .transit_mjd(ra_deg, now_mjd)
                .map_err(|e| anyhow::anyhow!("transit check: {e}"))?;
            println!(
                "registered {name} (RA={ra_deg:.4} Dec={dec_deg:.4}, tolerance +/-{dec_tol} deg)"
            );
            println!("nearest transit at MJD {transit:.6}");
            Ok(0)
        }

        Command::Reprocess { group_id } => {
            store.reset_group(&group_id, "operator reprocess")?;
            println!("group {group_id} reset to pending");
            Ok(0)
        }

        Command::Status { group_id } => {
            match group_id {
                Some(group_id) => {
                    let group = store
                        .get_group(&group_id)?
                        .with_context(|| format!("unknown group {group_id}"))?;
                    println!(
                        "group {} status={} retries={} mosaic={}",
                        group.group_id,
                        group.status.as_str(),
                        group.retry_count,
                        group.mosaic_id.as_deref().unwrap_or("-")
                    );
                    if let (Some(kind), Some(message)) =
                        (&group.failure_kind, &group.failure_message)
                    {
                        println!("failure: {kind}: {message}");
                    }
                    for entry in store.state_log_for_group(&group_id)? {
                        println!(
                            "  {} {} -> {} {}",
                            entry.ts,
                            entry.from_status,
                            entry.to_status,
                            entry.reason.as_deref().unwrap_or("")
                        );
                    }
                }
                None => {
                    match store.oldest_nonterminal_group()? {
                        Some(group) => println!(
                            "active group {} status={}",
                            group.group_id,
                            group.status.as_str()
                        ),
                        None => println!("no active groups"),
                    }
                    for event in store.recent_failures(20)? {
                        println!(
                            "  {} [{}] {}: {}",
                            event.ts,
                            event.subsystem,
                            event.error_kind.as_str(),
                            event.message
                        );
                    }
                }
            }
            Ok(0)
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    match &cli.config {
        Some(path) => PipelineConfig::load(path),
        None => {
            let default_path = PathBuf::from("skymosaic.toml");
            if default_path.exists() {
                PipelineConfig::load(&default_path)
            } else {
                Ok(PipelineConfig::default())
            }
        }
    }
}

fn parse_bpcal_arg(arg: &str) -> Result<(String, f64, f64)> {
    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        anyhow::bail!("expected NAME,RA_DEG,DEC_DEG, got {arg:?}");
    }
    let ra_deg: f64 = parts[1]
        .parse()
        .with_context(|| format!("bad RA {:?}", parts[1]))?;
    let dec_deg: f64 = parts[2]
        .parse()
        .with_context(|| format!("bad Dec {:?}", parts[2]))?;
    Ok((parts[0].to_string(), ra_deg, dec_deg))
}

fn build_collaborators(config: &PipelineConfig) -> Result<Collaborators> {
    let tools = &config.tools;
    let require = |name: &str, value: &str| -> Result<String> {
        if value.trim().is_empty() {
            anyhow::bail!("tools.{name} must be configured to run the pipeline");
        }
        Ok(value.to_string())
    };

    let data_registry = SqliteDataRegistry::open(&config.paths.data_registry_db_path())?;
    Ok(Collaborators {
        solver: Arc::new(CommandSolver {
            program: require("solver_cmd", &tools.solver_cmd)?,
        }),
        applier: Arc::new(CommandApplier {
            program: require("applier_cmd", &tools.applier_cmd)?,
        }),
        imager: Arc::new(CommandImager {
            program: require("imager_cmd", &tools.imager_cmd)?,
        }),
        mosaicker: Arc::new(CommandMosaicker {
            program: require("mosaic_cmd", &tools.mosaic_cmd)?,
        }),
        photometry: if tools.photometry_cmd.trim().is_empty() {
            None
        } else {
            Some(Arc::new(CommandPhotometry {
                program: tools.photometry_cmd.clone(),
            }))
        },
        data_registry: Arc::new(data_registry),
        converter: if tools.converter_cmd.trim().is_empty() {
            None
        } else {
            Some(Arc::new(CommandConverter {
                program: tools.converter_cmd.clone(),
            }))
        },
    })
}
