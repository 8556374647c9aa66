//! Per-group lifecycle state machine.
//!
//! One call to [`Orchestrator::advance`] moves a group at most one stage
//! along the DAG:
//!
//! ```text
//! pending -> calibrating -> calibrated -> imaging -> imaged
//!                                                      |
//!                                                      v
//!                                                 mosaicking -> completed
//! any non-terminal -> failed
//! ```
//!
//! Every status change is committed before the next external side effect, so
//! a crash at any point resumes from the last committed status; artifact
//! existence checks keep completed sub-steps from running twice.

mod calibrate;
mod mosaic;
mod science;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::catalog::CalibratorCatalog;
use crate::config::PipelineConfig;
use crate::errors::{ErrorKind, StageError};
use crate::external::Collaborators;
use crate::models::{GroupStatus, MosaicGroup};
use crate::msmeta::MsMetadataReader;
use crate::organizer::FileOrganizer;
use crate::registry::CalibrationRegistry;
use crate::runner::{Deadline, StageRunner};
use crate::store::StateStore;

/// What one advance call did to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The group moved to a new status.
    Progressed(GroupStatus),
    /// Nothing changed; the reason says why (breaker open, deadline, ...).
    /// The group will be retried on a future tick.
    Unchanged(String),
    /// The group transitioned to `failed`.
    Failed(ErrorKind),
}

pub struct Orchestrator {
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) store: Arc<StateStore>,
    pub(crate) registry: Arc<CalibrationRegistry>,
    pub(crate) catalog: Arc<CalibratorCatalog>,
    pub(crate) organizer: Arc<FileOrganizer>,
    pub(crate) runner: Arc<StageRunner>,
    pub(crate) reader: MsMetadataReader,
    pub(crate) collab: Collaborators,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<PipelineConfig>,
        store: Arc<StateStore>,
        registry: Arc<CalibrationRegistry>,
        catalog: Arc<CalibratorCatalog>,
        organizer: Arc<FileOrganizer>,
        runner: Arc<StageRunner>,
        collab: Collaborators,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            catalog,
            organizer,
            runner,
            reader: MsMetadataReader,
            collab,
        }
    }

    /// Advance a group one stage. Safe to call on terminal groups (no-op).
    pub async fn advance(&self, group_id: &str) -> Result<AdvanceOutcome> {
        let group = self
            .store
            .get_group(group_id)?
            .with_context(|| format!("unknown group {group_id}"))?;
        let deadline = self.group_deadline();

        let outcome = match group.status {
            GroupStatus::Pending => self.begin_calibration(&group).await?,
            GroupStatus::Calibrating => self.solve_stage(&group, deadline).await?,
            GroupStatus::Calibrated => self.start_apply_stage(&group, deadline).await?,
            GroupStatus::Imaging => self.imaging_stage(&group, deadline).await?,
            GroupStatus::Imaged => self.validate_for_mosaic(&group)?,
            GroupStatus::Mosaicking => self.mosaic_stage(&group, deadline).await?,
            GroupStatus::Completed | GroupStatus::Failed => {
                AdvanceOutcome::Unchanged(format!("group is terminal ({})", group.status.as_str()))
            }
        };

        match &outcome {
            AdvanceOutcome::Progressed(to) => {
                info!(group_id, to = to.as_str(), "group advanced");
            }
            AdvanceOutcome::Unchanged(reason) => {
                info!(group_id, reason = %reason, "group unchanged");
            }
            AdvanceOutcome::Failed(kind) => {
                warn!(group_id, kind = kind.as_str(), "group failed");
            }
        }
        Ok(outcome)
    }

    fn group_deadline(&self) -> Deadline {
        match self.config.scheduler.group_deadline_secs {
            Some(secs) => Deadline::within(Duration::from_secs(secs)),
            None => Deadline::never(),
        }
    }

    /// Terminal failure transition with the error's kind and message.
    pub(crate) fn fail(
        &self,
        group: &MosaicGroup,
        error: &StageError,
        attempts: i64,
    ) -> Result<AdvanceOutcome> {
        self.store.fail_group(
            &group.group_id,
            group.status,
            error.kind,
            &error.message,
            attempts,
        )?;
        Ok(AdvanceOutcome::Failed(error.kind))
    }

    /// Retryable problems leave the group for a later tick; everything else
    /// is terminal.
    pub(crate) fn soft_fail(
        &self,
        group: &MosaicGroup,
        error: StageError,
    ) -> Result<AdvanceOutcome> {
        if error.kind != ErrorKind::Permanent && crate::recovery::is_retryable(&error) {
            Ok(AdvanceOutcome::Unchanged(error.message))
        } else {
            self.fail(group, &error, 0)
        }
    }

    /// Commit a forward transition.
    pub(crate) fn progress(
        &self,
        group: &MosaicGroup,
        to: GroupStatus,
        reason: &str,
    ) -> Result<AdvanceOutcome> {
        self.store
            .advance_group_status(&group.group_id, group.status, to, Some(reason), 0)?;
        Ok(AdvanceOutcome::Progressed(to))
    }
}
