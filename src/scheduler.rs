//! Single-action scheduler loop.
//!
//! Each tick does exactly one thing: resume the oldest non-terminal group,
//! otherwise form a new group, otherwise ask the converter for more data,
//! otherwise sleep. Multiple orchestrator instances may share the store;
//! per-group advisory locks keep them from advancing the same group.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::grouping::GroupBuilder;
use crate::models::{MsEntry, MsStage};
use crate::msmeta::MsMetadataReader;
use crate::orchestrator::{AdvanceOutcome, Orchestrator};
use crate::organizer::FileOrganizer;
use crate::recovery::FailureLedger;
use crate::registry::CalibrationRegistry;
use crate::store::StateStore;

/// What a tick accomplished.
#[derive(Debug)]
pub enum TickOutcome {
    /// An existing group was advanced (or left unchanged/failed).
    Advanced {
        group_id: String,
        outcome: AdvanceOutcome,
    },
    /// A new group was formed and initialized to `pending`.
    GroupFormed(String),
    /// The converter produced new MS containers.
    Converted(usize),
    /// Nothing to do.
    Idle,
}

pub struct Scheduler {
    config: Arc<PipelineConfig>,
    store: Arc<StateStore>,
    orchestrator: Arc<Orchestrator>,
    builder: GroupBuilder,
    organizer: Arc<FileOrganizer>,
    registry: Arc<CalibrationRegistry>,
    ledger: FailureLedger,
    reader: MsMetadataReader,
    instance_id: String,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<StateStore>,
        orchestrator: Arc<Orchestrator>,
        organizer: Arc<FileOrganizer>,
        registry: Arc<CalibrationRegistry>,
    ) -> Self {
        let builder = GroupBuilder::new(store.clone(), config.grouping.clone());
        let ledger = FailureLedger::new(store.clone());
        let instance_id = format!("orchestrator-{}", std::process::id());
        Self {
            config,
            store,
            orchestrator,
            builder,
            organizer,
            registry,
            ledger,
            reader: MsMetadataReader,
            instance_id,
        }
    }

    /// Startup repairs: reconcile interrupted moves, sweep registry rows
    /// whose artifacts vanished, report resumable work.
    pub fn startup(&self) -> Result<()> {
        match self.organizer.reconcile() {
            Ok(0) => {}
            Ok(n) => info!(repaired = n, "reconciled MS index rows after restart"),
            Err(e) => warn!("startup reconcile failed: {e}"),
        }
        match self.registry.sweep_missing() {
            Ok(0) => {}
            Ok(n) => info!(swept = n, "swept calibration sets with missing artifacts"),
            Err(e) => warn!("registry sweep failed: {e}"),
        }
        if let Some(group) = self.store.oldest_nonterminal_group()? {
            info!(
                group_id = %group.group_id,
                status = group.status.as_str(),
                "resumable group found at startup"
            );
        }
        Ok(())
    }

    /// One scheduler action. At most one group is advanced per tick.
    pub async fn tick(&self) -> Result<TickOutcome> {
        self.ledger.prune();

        if let Some(group) = self.store.oldest_nonterminal_group()? {
            let group_id = group.group_id.clone();
            if !self.store.try_lock_group(
                &group_id,
                &self.instance_id,
                self.config.scheduler.lock_stale_secs,
            )? {
                info!(group_id = %group_id, "group locked by another instance");
                return Ok(TickOutcome::Idle);
            }
            let advanced = self.orchestrator.advance(&group_id).await;
            self.store.unlock_group(&group_id, &self.instance_id)?;
            return Ok(TickOutcome::Advanced {
                group_id,
                outcome: advanced?,
            });
        }

        if let Some(group_id) = self.builder.build_next()? {
            return Ok(TickOutcome::GroupFormed(group_id));
        }

        if let Some(converted) = self.convert_backfill().await? {
            if converted > 0 {
                return Ok(TickOutcome::Converted(converted));
            }
        }

        Ok(TickOutcome::Idle)
    }

    /// Continuous operation until the shutdown signal flips.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = Duration::from_secs(self.config.scheduler.poll_interval_secs.max(1));
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, stopping scheduler loop");
                return Ok(());
            }
            let outcome = self.tick().await;
            match outcome {
                Ok(TickOutcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("tick failed: {e:#}");
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Ask the converter for the window after the newest indexed MS. Returns
    /// `None` when no converter is wired or there is nothing to extend.
    async fn convert_backfill(&self) -> Result<Option<usize>> {
        let converter = match &self.orchestrator.collab.converter {
            Some(converter) => converter.clone(),
            None => return Ok(None),
        };
        let newest = self
            .store
            .list_ms_by_stages(
                &[MsStage::Converted, MsStage::Calibrated, MsStage::Imaged, MsStage::Done],
                None,
            )?
            .into_iter()
            .map(|e| e.end_mjd)
            .fold(None::<f64>, |acc, end| {
                Some(acc.map(|a| a.max(end)).unwrap_or(end))
            });
        let start = match newest {
            Some(end) => end,
            // Nothing indexed yet: leave bootstrap to the converter service.
            None => return Ok(None),
        };
        // One group's worth of 5-minute chunks.
        let span_days = self.config.grouping.ms_per_group as f64 * 5.0 / 60.0 / 24.0;
        let paths = match converter.convert(start, start + span_days).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!("conversion request failed: {e}");
                return Ok(Some(0));
            }
        };

        let mut ingested = 0;
        for path in paths {
            // The converter is idempotent per timestamp and may re-report
            // containers that are already indexed and further along.
            if self.store.get_ms(&path.to_string_lossy())?.is_some() {
                continue;
            }
            match self.reader.read_meta(&path) {
                Ok(meta) => {
                    let dec = self.reader.mean_declination(&path).ok();
                    self.store.upsert_ms(&MsEntry {
                        path: path.to_string_lossy().into_owned(),
                        start_mjd: meta.start_mjd,
                        mid_mjd: meta.mid_mjd(),
                        end_mjd: meta.end_mjd,
                        declination_deg: dec,
                        stage: MsStage::Converted,
                        cal_applied: false,
                        imagename: None,
                        updated_at: 0,
                    })?;
                    ingested += 1;
                }
                Err(e) => warn!(path = %path.display(), "converter returned unreadable MS: {e}"),
            }
        }
        if ingested > 0 {
            info!(ingested, "indexed newly converted MS");
        }
        Ok(Some(ingested))
    }
}
