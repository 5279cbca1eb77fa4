// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The launcher's view of the virtualization daemon.
//!
//! The daemon is an external process that owns the actual domains. This
//! module defines the commands the launcher may send it (the [`Daemon`]
//! trait), the asynchronous events it emits, and the transports that carry
//! both: a framed Unix socket protocol ([`socket`]) and an in-process
//! simulation ([`sim`]) used by tests and by `virt-launcher run --simulate`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain_api_types::{MigrationPolicy, MigrationTarget};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::spec::DefinitionChange;

pub mod sim;
pub mod socket;

/// Errors returned by daemon commands.
///
/// Errors fall into three classes, which callers must treat differently:
///
/// - Retryable: the request was never delivered, so sending it again cannot
///   duplicate its side effects (`NotConnected`).
/// - Ambiguous: the request may or may not have taken effect (`Disconnected`,
///   `Timeout`). These are never retried blindly; the caller re-reads state.
/// - Semantic: the daemon understood and rejected the request. These are
///   surfaced as-is.
#[derive(Clone, Debug, Error, Deserialize, Serialize, PartialEq, Eq)]
pub enum DaemonError {
    #[error("not connected to the virtualization daemon")]
    NotConnected,

    #[error("domain handle from connection generation {0} is stale")]
    StaleHandle(u64),

    #[error("lost connection to the virtualization daemon: {0}")]
    Disconnected(String),

    #[error("virtualization daemon request timed out")]
    Timeout,

    #[error("no domain named {0}")]
    NoSuchDomain(String),

    #[error("invalid domain definition: {0}")]
    InvalidDefinition(String),

    #[error("operation invalid in the domain's current state: {0}")]
    OperationInvalid(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("guest agent is not connected")]
    AgentUnavailable,

    #[error("guest agent command {command} failed: {message}")]
    AgentCommandFailed { command: String, message: String },

    #[error("daemon protocol error: {0}")]
    Protocol(String),
}

impl DaemonError {
    /// True if the request was certainly not delivered.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// True if the request may have been delivered and acted on.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Timeout)
    }
}

/// The reason a domain is paused, as reported by the daemon.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    User,
    Migration,
    PostCopy,
    IoError,
    Unknown,
}

/// The reason a domain is shut off, as reported by the daemon.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutoffReason {
    /// The domain has not run since it was defined.
    Unknown,
    Shutdown,
    Destroyed,
    Crashed,
    Migrated,
    Failed,
}

/// A domain state in the daemon's own vocabulary.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum RawDomainState {
    NoState,
    Running,
    Blocked,
    Paused(PauseReason),
    Shutdown,
    Shutoff(ShutoffReason),
    Crashed,
    PmSuspended,
}

/// What the daemon knows about a domain looked up by name.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DomainInfo {
    pub uuid: Uuid,
    pub state: RawDomainState,

    /// The daemon's current definition document for the domain.
    pub definition: String,
}

/// Progress of the daemon's current job on a domain.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobInfo {
    pub active: bool,
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    pub dirty_rate_pages_per_sec: u64,
    pub iteration: u32,
}

/// An event the daemon emits about a domain.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DomainEventKind {
    Defined,
    Undefined,
    Started,
    Suspended(PauseReason),
    Resumed,
    /// The guest began processing a shutdown request.
    ShuttingDown,
    Stopped(ShutoffReason),
    Crashed,
    PmSuspended,

    /// The in-guest agent connected to or disconnected from its channel.
    AgentLifecycle { connected: bool },

    /// The domain's migration job finished. A successful outgoing migration
    /// is also reported as `Stopped(Migrated)`.
    JobCompleted,
    JobFailed { message: String },
    JobCancelled,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DaemonEvent {
    pub domain: String,
    pub kind: DomainEventKind,
}

/// Commands the launcher can send to the virtualization daemon.
///
/// Domains are addressed by name. Validating that a caller's reference to a
/// domain is still current is the connection manager's job, not the
/// transport's.
#[async_trait]
pub trait Daemon: Send + Sync {
    async fn lookup_by_name(&self, name: &str)
        -> Result<DomainInfo, DaemonError>;

    /// Defines (or redefines) a domain from a definition document, returning
    /// its UUID.
    async fn define(&self, name: &str, definition: &str)
        -> Result<Uuid, DaemonError>;

    async fn undefine(&self, name: &str) -> Result<(), DaemonError>;

    async fn start(&self, name: &str) -> Result<(), DaemonError>;

    async fn pause(&self, name: &str) -> Result<(), DaemonError>;

    async fn resume(&self, name: &str) -> Result<(), DaemonError>;

    /// Asks the guest to shut down. Returns once the request is delivered,
    /// not once the guest has stopped.
    async fn shutdown(&self, name: &str) -> Result<(), DaemonError>;

    /// Stops the domain immediately.
    async fn destroy(&self, name: &str) -> Result<(), DaemonError>;

    /// Applies a new definition to a running domain. Fails with
    /// `Unsupported` if any of `changes` cannot be applied live.
    async fn live_update(
        &self,
        name: &str,
        definition: &str,
        changes: &[DefinitionChange],
    ) -> Result<(), DaemonError>;

    /// Starts an outgoing live migration job. Returns once the job has
    /// started; the outcome arrives as events.
    async fn migrate_start(
        &self,
        name: &str,
        target: &MigrationTarget,
        policy: &MigrationPolicy,
    ) -> Result<(), DaemonError>;

    /// Requests that the domain's migration job be aborted.
    async fn migrate_abort(&self, name: &str) -> Result<(), DaemonError>;

    async fn job_info(&self, name: &str) -> Result<JobInfo, DaemonError>;

    /// Runs a command through the guest agent channel and returns the
    /// command's `return` payload.
    async fn guest_agent_command(
        &self,
        name: &str,
        command: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DaemonError>;
}

/// A live connection to the daemon: a command channel and its event stream.
///
/// The event stream closing means the connection is gone.
pub struct DaemonLink {
    pub daemon: Arc<dyn Daemon>,
    pub events: mpsc::UnboundedReceiver<DaemonEvent>,
}

/// Establishes connections to the daemon.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<DaemonLink, DaemonError>;
}
