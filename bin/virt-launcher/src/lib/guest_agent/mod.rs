// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodically collects metadata from the agent running inside the guest.
//!
//! The poller follows a [`PollerTarget`] published by the VM's state
//! driver. It polls only while the target says the domain is running, and
//! it renegotiates the agent's capabilities whenever the target's epoch
//! changes, which the driver bumps each time the agent (re)connects or the
//! daemon connection is replaced.
//!
//! Each category is fetched with its own command and its own timeout, so a
//! slow or broken command only makes its own category stale.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use domain_api_types::guest::{
    CategoryReport, GuestFilesystem, GuestInfo, GuestInterface, GuestLoad,
    GuestMetadataCategory, GuestMetadataReport, GuestOsInfo, GuestTimezone,
    GuestUser,
};
use launcher_config_toml::GuestAgentConfig;
use serde_derive::Deserialize;
use slog::{debug, info, warn, Logger};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionError, ConnectionManager, DomainHandle};
use crate::daemon::DaemonError;

mod capabilities;
mod snapshot;

pub use capabilities::Capabilities;
pub use snapshot::GuestMetadataSnapshot;

#[derive(Debug, Error)]
pub enum GuestAgentError {
    #[error("guest agent does not support {0}")]
    Unsupported(GuestMetadataCategory),

    #[error("guest agent command for {0} timed out after {1:?}")]
    Timeout(GuestMetadataCategory, Duration),

    #[error("domain is not running")]
    NotRunning,

    #[error("guest agent error: {0}")]
    Agent(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Why the agent's capabilities could not be read.
#[derive(Debug, Error)]
enum NegotiationError {
    #[error("guest-info timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Failed(#[from] GuestAgentError),
}

impl NegotiationError {
    /// The error to report for a poll of `category` that needed the
    /// capabilities first.
    fn for_category(self, category: GuestMetadataCategory) -> GuestAgentError {
        match self {
            Self::TimedOut(after) => GuestAgentError::Timeout(category, after),
            Self::Failed(e) => e,
        }
    }
}

/// What the poller should be polling.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollerTarget {
    pub handle: Option<DomainHandle>,
    pub running: bool,

    /// Identifies the current guest agent connection.
    pub epoch: u64,
}

impl PollerTarget {
    fn active_handle(&self) -> Option<&DomainHandle> {
        if self.running {
            self.handle.as_ref()
        } else {
            None
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct HostName {
    host_name: String,
}

/// Decodes an agent reply for `category`.
fn decode(
    category: GuestMetadataCategory,
    reply: serde_json::Value,
) -> Result<GuestInfo, serde_json::Error> {
    use serde_json::from_value;

    Ok(match category {
        GuestMetadataCategory::OsInfo => {
            GuestInfo::OsInfo(from_value::<GuestOsInfo>(reply)?)
        }
        GuestMetadataCategory::Filesystems => {
            GuestInfo::Filesystems(from_value::<Vec<GuestFilesystem>>(reply)?)
        }
        GuestMetadataCategory::Interfaces => {
            GuestInfo::Interfaces(from_value::<Vec<GuestInterface>>(reply)?)
        }
        GuestMetadataCategory::Users => {
            GuestInfo::Users(from_value::<Vec<GuestUser>>(reply)?)
        }
        GuestMetadataCategory::Load => {
            GuestInfo::Load(from_value::<GuestLoad>(reply)?)
        }
        GuestMetadataCategory::Hostname => {
            GuestInfo::Hostname(from_value::<HostName>(reply)?.host_name)
        }
        GuestMetadataCategory::Timezone => {
            GuestInfo::Timezone(from_value::<GuestTimezone>(reply)?)
        }
    })
}

/// True if the agent rejected a command because it does not know it.
fn is_unknown_command(err: &DaemonError) -> bool {
    matches!(err, DaemonError::AgentCommandFailed { message, .. }
        if message.contains("has not been found"))
}

pub struct GuestAgentPoller {
    conn: ConnectionManager,
    config: GuestAgentConfig,
    target: watch::Receiver<PollerTarget>,
    snapshot: Arc<RwLock<GuestMetadataSnapshot>>,
    capabilities: tokio::sync::Mutex<Option<Capabilities>>,
    log: Logger,
}

impl GuestAgentPoller {
    pub fn new(
        conn: ConnectionManager,
        config: GuestAgentConfig,
        target: watch::Receiver<PollerTarget>,
        log: Logger,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            config,
            target,
            snapshot: Arc::new(RwLock::new(GuestMetadataSnapshot::default())),
            capabilities: tokio::sync::Mutex::new(None),
            log,
        })
    }

    /// Spawns the polling task. It runs until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move { poller.run(cancel).await })
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(self.log, "guest agent poller started";
              "interval" => ?self.config.poll_interval());

        let mut target_rx = self.target.clone();
        loop {
            let target = target_rx.borrow_and_update().clone();
            let pollable = target.active_handle().is_some();

            if pollable {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.poll_all(&target) => {}
                }
            } else {
                debug!(self.log, "guest agent polling suspended";
                       "has_handle" => target.handle.is_some());
            }

            let interval = async {
                if pollable {
                    tokio::time::sleep(self.config.poll_interval()).await
                } else {
                    std::future::pending().await
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval => {}
                res = target_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        info!(self.log, "guest agent poller exiting");
    }

    /// The current metadata. Values are advisory unless the domain is
    /// running.
    pub fn report(&self) -> GuestMetadataReport {
        let advisory = !self.target.borrow().running;
        self.snapshot.read().unwrap().report(advisory)
    }

    /// Forgets all collected metadata and negotiated capabilities.
    pub async fn clear(&self) {
        *self.capabilities.lock().await = None;
        self.snapshot.write().unwrap().clear();
    }

    /// Polls one category now and returns its updated report.
    ///
    /// The report is returned even if the poll failed, with the category
    /// marked stale, except when the agent does not implement the category
    /// at all or the command timed out.
    pub async fn poll(
        &self,
        category: GuestMetadataCategory,
    ) -> Result<CategoryReport, GuestAgentError> {
        let target = self.target.borrow().clone();
        if target.active_handle().is_none() {
            return Err(GuestAgentError::NotRunning);
        }

        let caps = self
            .capabilities_for(&target)
            .await
            .map_err(|e| e.for_category(category))?;
        if !caps.supports(category) {
            self.snapshot
                .write()
                .unwrap()
                .record_unsupported(category, Utc::now());
            return Err(GuestAgentError::Unsupported(category));
        }

        match self.poll_category(&target, category).await {
            Ok(()) | Err(GuestAgentError::Agent(_)) => Ok(self
                .snapshot
                .read()
                .unwrap()
                .category_report(category, false)),
            Err(e) => Err(e),
        }
    }

    async fn poll_all(&self, target: &PollerTarget) {
        let caps = match self.capabilities_for(target).await {
            Ok(caps) => caps,
            Err(e) => {
                warn!(self.log, "failed to query guest agent capabilities";
                      "error" => %e);
                self.snapshot
                    .write()
                    .unwrap()
                    .mark_all_stale(&e.to_string(), Utc::now());
                return;
            }
        };

        let mut polls = Vec::new();
        for category in GuestMetadataCategory::ALL {
            if caps.supports(category) {
                polls.push(self.poll_category(target, category));
            } else {
                self.snapshot
                    .write()
                    .unwrap()
                    .record_unsupported(category, Utc::now());
            }
        }

        let results = futures::future::join_all(polls).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        debug!(self.log, "guest agent poll finished";
               "polled" => results.len(),
               "failed" => failed);
    }

    /// Returns the capabilities for the target's epoch, negotiating them if
    /// the cached ones belong to an earlier epoch.
    async fn capabilities_for(
        &self,
        target: &PollerTarget,
    ) -> Result<Capabilities, NegotiationError> {
        let mut cached = self.capabilities.lock().await;
        if let Some(caps) = cached.as_ref() {
            if caps.epoch == target.epoch {
                return Ok(caps.clone());
            }
        }

        let handle =
            target.active_handle().ok_or(GuestAgentError::NotRunning)?;
        let timeout = self.config.command_timeout();
        let reply = tokio::time::timeout(
            timeout,
            self.conn.with_domain(handle, |daemon, name| async move {
                daemon
                    .guest_agent_command(
                        &name,
                        capabilities::GUEST_INFO,
                        serde_json::json!({}),
                        timeout,
                    )
                    .await
            }),
        )
        .await
        .map_err(|_| NegotiationError::TimedOut(timeout))?
        .map_err(|e| match e {
            ConnectionError::Daemon(DaemonError::Timeout) => {
                NegotiationError::TimedOut(timeout)
            }
            ConnectionError::Daemon(e) => {
                GuestAgentError::Agent(e.to_string()).into()
            }
            other => GuestAgentError::Connection(other).into(),
        })?;

        let caps = Capabilities::from_guest_info(target.epoch, reply).map_err(
            |e| GuestAgentError::Agent(format!("bad guest-info: {e}")),
        )?;
        info!(self.log, "negotiated guest agent capabilities";
              "epoch" => caps.epoch,
              "version" => &caps.version);
        *cached = Some(caps.clone());
        Ok(caps)
    }

    async fn poll_category(
        &self,
        target: &PollerTarget,
        category: GuestMetadataCategory,
    ) -> Result<(), GuestAgentError> {
        let handle =
            target.active_handle().ok_or(GuestAgentError::NotRunning)?;
        let timeout = self.config.command_timeout();
        let issued_at = Utc::now();

        let result = tokio::time::timeout(
            timeout,
            self.conn.with_domain(handle, |daemon, name| async move {
                daemon
                    .guest_agent_command(
                        &name,
                        category.command(),
                        serde_json::json!({}),
                        timeout,
                    )
                    .await
            }),
        )
        .await;

        let failure = match result {
            Ok(Ok(reply)) => match decode(category, reply) {
                Ok(info) => {
                    self.snapshot
                        .write()
                        .unwrap()
                        .record_success(info, issued_at);
                    return Ok(());
                }
                Err(e) => GuestAgentError::Agent(format!(
                    "malformed {} reply: {}",
                    category, e
                )),
            },
            Err(_) | Ok(Err(ConnectionError::Daemon(DaemonError::Timeout))) => {
                GuestAgentError::Timeout(category, timeout)
            }
            Ok(Err(ConnectionError::Daemon(e))) if is_unknown_command(&e) => {
                warn!(self.log, "guest agent rejected advertised command";
                      "category" => %category);
                if let Some(caps) = self.capabilities.lock().await.as_mut() {
                    caps.revoke(category);
                }
                self.snapshot
                    .write()
                    .unwrap()
                    .record_unsupported(category, issued_at);
                return Err(GuestAgentError::Unsupported(category));
            }
            Ok(Err(ConnectionError::Daemon(e))) => {
                GuestAgentError::Agent(e.to_string())
            }
            Ok(Err(e)) => GuestAgentError::Connection(e),
        };

        debug!(self.log, "guest metadata poll failed";
               "category" => %category,
               "error" => %failure);
        self.snapshot.write().unwrap().record_failure(
            category,
            failure.to_string(),
            issued_at,
        );
        Err(failure)
    }
}
