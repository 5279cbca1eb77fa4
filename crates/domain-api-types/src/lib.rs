// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exchanged between a VM launcher, the controller that
//! drives it, and the virtualization daemon it talks to.

use schemars::JsonSchema;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

pub mod guest;
pub mod placement;
pub mod spec;

pub use placement::{NodeCapacity, NumaNodeCapacity, PlacementConstraints};
pub use spec::{MigrationPolicy, UpdatePolicy, VmSpec};

/// The role a launcher plays in a live migration.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum MigrateRole {
    Source,
    Target,
}

/// The most recently confirmed state of a domain.
///
/// A launcher only ever reports a state it has observed through the daemon's
/// event stream or confirmed by reading the domain's state directly.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case", tag = "state", content = "role")]
pub enum DomainState {
    /// No domain with this VM's name is known to the daemon.
    Absent,
    /// The domain is defined but has not run since it was defined.
    Defined,
    Running,
    Paused,
    /// The guest is processing a shutdown request.
    ShuttingDown,
    Shutoff,
    /// The domain stopped unexpectedly. Crashed domains are never restarted
    /// by the launcher; recreating them is the caller's decision.
    Crashed,
    Migrating(MigrateRole),
    PmSuspended,
    /// The launcher could not confirm the outcome of its last command and
    /// could not read the domain's state afterwards.
    Unknown,
}

impl DomainState {
    /// Returns true if the domain exists and has guest execution state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Running
                | Self::Paused
                | Self::ShuttingDown
                | Self::Migrating(_)
                | Self::PmSuspended
        )
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Defined => write!(f, "defined"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Shutoff => write!(f, "shut off"),
            Self::Crashed => write!(f, "crashed"),
            Self::Migrating(MigrateRole::Source) => {
                write!(f, "migrating (source)")
            }
            Self::Migrating(MigrateRole::Target) => {
                write!(f, "migrating (target)")
            }
            Self::PmSuspended => write!(f, "pm-suspended"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Where a live migration should send the domain.
#[derive(
    Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub struct MigrationTarget {
    /// The daemon URI of the destination host, e.g.
    /// `qemu+tls://host.example/system`.
    pub uri: String,

    /// An optional override for the migration data stream address.
    #[serde(default)]
    pub migrate_uri: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// The session exists but the daemon has not acknowledged the job yet.
    Sync,
    Active,
    /// Cancellation was requested and the launcher is waiting for the daemon
    /// to report the job's terminal outcome.
    Aborting,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress counters reported by the daemon's migration job.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
)]
pub struct MigrationProgress {
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    pub dirty_rate_pages_per_sec: u64,
    pub iteration: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: Uuid,
    pub role: MigrateRole,
    pub state: MigrationState,
    pub target: String,
    pub progress: MigrationProgress,

    /// Why the migration failed, if it did.
    pub error: Option<String>,
}

/// The externally visible state of a launcher's domain.
///
/// `gen` increases by one every time either field changes, so consumers can
/// detect updates they missed.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DomainStateMonitorResponse {
    pub gen: u64,
    pub state: DomainState,

    /// The status of the most recent migration out of this domain, if one was
    /// ever attempted.
    pub migration: Option<MigrationStatus>,
}
