// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping for outgoing live migrations.
//!
//! The daemon runs the migration job itself. The launcher's part is to start
//! the job, sample its progress, enforce a deadline, relay cancellation, and
//! map the job's terminal event to an outcome. The loop that does this lives
//! in the VM state driver; this module holds the session record it updates.

use std::time::Duration;

use domain_api_types::{
    MigrateRole, MigrationPolicy, MigrationProgress, MigrationState,
    MigrationStatus, MigrationTarget,
};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::daemon::JobInfo;

/// Reasons a migration out of this launcher's domain failed.
#[derive(Clone, Debug, Error, Deserialize, Serialize, PartialEq, Eq)]
pub enum MigrateError {
    #[error("failed to start migration job: {0}")]
    StartFailed(String),

    #[error("migration job failed: {0}")]
    JobFailed(String),

    #[error("migration did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("domain crashed during migration")]
    DomainCrashed,

    #[error("migration job ended while the daemon connection was down")]
    OutcomeLost,
}

/// How a migration session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The domain now runs on the target host and is gone from this one.
    Completed,

    /// The migration failed. Unless the domain crashed, it is running on this
    /// host again.
    Failed(MigrateError),

    /// The migration was cancelled, by this launcher or by the daemon. The
    /// domain is running on this host again.
    Cancelled,
}

impl MigrationOutcome {
    fn state(&self) -> MigrationState {
        match self {
            Self::Completed => MigrationState::Completed,
            Self::Failed(_) => MigrationState::Failed,
            Self::Cancelled => MigrationState::Cancelled,
        }
    }
}

/// Why the launcher asked the daemon to abort a migration job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AbortReason {
    Requested,
    Deadline,
}

/// One outgoing migration attempt.
#[derive(Debug)]
pub(crate) struct MigrationSession {
    pub id: Uuid,
    pub target: MigrationTarget,
    pub policy: MigrationPolicy,
    pub state: MigrationState,
    pub progress: MigrationProgress,
    pub deadline: Instant,
    pub timeout: Duration,
    pub abort: Option<AbortReason>,
    pub error: Option<String>,
}

impl MigrationSession {
    /// Starts a session. The policy's timeout, if any, overrides
    /// `default_timeout`.
    pub fn new(
        target: MigrationTarget,
        policy: MigrationPolicy,
        default_timeout: Duration,
    ) -> Self {
        let timeout = policy
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);

        Self {
            id: Uuid::new_v4(),
            target,
            policy,
            state: MigrationState::Sync,
            progress: MigrationProgress::default(),
            deadline: Instant::now() + timeout,
            timeout,
            abort: None,
            error: None,
        }
    }

    pub fn status(&self) -> MigrationStatus {
        MigrationStatus {
            id: self.id,
            role: MigrateRole::Source,
            state: self.state,
            target: self.target.uri.clone(),
            progress: self.progress,
            error: self.error.clone(),
        }
    }

    /// Folds a job progress sample into the session. Returns true if the
    /// published status changed.
    pub fn record_progress(&mut self, job: &JobInfo) -> bool {
        if !job.active {
            return false;
        }

        let progress = MigrationProgress {
            data_total: job.data_total,
            data_processed: job.data_processed,
            data_remaining: job.data_remaining,
            dirty_rate_pages_per_sec: job.dirty_rate_pages_per_sec,
            iteration: job.iteration,
        };

        let changed = progress != self.progress
            || self.state == MigrationState::Sync;
        self.progress = progress;
        if self.state == MigrationState::Sync {
            self.state = MigrationState::Active;
        }
        changed
    }

    /// Marks the session as aborting. Only the first reason sticks.
    pub fn begin_abort(&mut self, reason: AbortReason) -> bool {
        if self.abort.is_some() || self.state.is_terminal() {
            return false;
        }

        self.abort = Some(reason);
        self.state = MigrationState::Aborting;
        true
    }

    /// The outcome implied by the daemon reporting that the job was
    /// cancelled. A cancellation the launcher issued because the deadline
    /// passed is a failure, not a cancellation.
    pub fn cancelled_outcome(&self) -> MigrationOutcome {
        match self.abort {
            Some(AbortReason::Deadline) => MigrationOutcome::Failed(
                MigrateError::DeadlineExceeded(self.timeout),
            ),
            _ => MigrationOutcome::Cancelled,
        }
    }

    pub fn finish(&mut self, outcome: &MigrationOutcome) {
        self.state = outcome.state();
        if let MigrationOutcome::Failed(e) = outcome {
            self.error = Some(e.to_string());
        }
    }
}
