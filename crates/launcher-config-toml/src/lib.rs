// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the VM launcher.
//!
//! Every timing knob the launcher uses is policy rather than something it can
//! derive, so all of them live here. Each field has a default; an empty file
//! is a valid configuration. Durations are written in milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub guest_agent: GuestAgentConfig,
}

/// Settings for the connection to the virtualization daemon.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// The daemon's control socket.
    pub socket_path: PathBuf,

    /// The first delay between reconnection attempts.
    pub backoff_initial_ms: u64,

    /// The longest delay between reconnection attempts. Reconnection is
    /// retried indefinitely; only the interval is capped.
    pub backoff_ceiling_ms: u64,

    /// How long a request may wait for the connection to come back before
    /// failing with a connection error.
    pub retry_budget_ms: u64,

    /// How long to wait for the daemon to answer a single request.
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/virtd/virtd-sock"),
            backoff_initial_ms: 250,
            backoff_ceiling_ms: 30_000,
            retry_budget_ms: 60_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_millis(self.backoff_ceiling_ms)
    }

    pub fn retry_budget(&self) -> Duration {
        Duration::from_millis(self.retry_budget_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings for the domain lifecycle controller.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long to wait for the daemon to confirm a command with an event
    /// before reading the domain's state directly.
    pub confirm_timeout_ms: u64,

    /// The default deadline for a graceful shutdown before it is escalated to
    /// a forced destroy.
    pub shutdown_deadline_ms: u64,

    /// How often to sample migration progress.
    pub migration_progress_interval_ms: u64,

    /// The default deadline for a live migration.
    pub migration_deadline_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: 30_000,
            shutdown_deadline_ms: 120_000,
            migration_progress_interval_ms: 1_000,
            migration_deadline_ms: 30 * 60 * 1_000,
        }
    }
}

impl LifecycleConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn migration_progress_interval(&self) -> Duration {
        Duration::from_millis(self.migration_progress_interval_ms)
    }

    pub fn migration_deadline(&self) -> Duration {
        Duration::from_millis(self.migration_deadline_ms)
    }
}

/// Settings for the guest agent poller.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct GuestAgentConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,

    /// The timeout for each individual guest agent command. This is
    /// independent of the poll interval.
    pub command_timeout_ms: u64,
}

impl Default for GuestAgentConfig {
    fn default() -> Self {
        Self { enabled: true, poll_interval_ms: 10_000, command_timeout_ms: 5_000 }
    }
}

impl GuestAgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Errors which may be returned when parsing the launcher configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl Config {
    /// Checks relationships between fields that serde cannot express.
    pub fn validate(&self) -> Result<(), ParseError> {
        let conn = &self.connection;
        if conn.backoff_initial_ms == 0 {
            return Err(ParseError::InvalidValue(
                "connection.backoff_initial_ms",
                "must be nonzero".to_string(),
            ));
        }

        if conn.backoff_ceiling_ms < conn.backoff_initial_ms {
            return Err(ParseError::InvalidValue(
                "connection.backoff_ceiling_ms",
                format!(
                    "{} is less than backoff_initial_ms ({})",
                    conn.backoff_ceiling_ms, conn.backoff_initial_ms
                ),
            ));
        }

        if self.lifecycle.confirm_timeout_ms == 0 {
            return Err(ParseError::InvalidValue(
                "lifecycle.confirm_timeout_ms",
                "must be nonzero".to_string(),
            ));
        }

        if self.guest_agent.enabled && self.guest_agent.poll_interval_ms == 0 {
            return Err(ParseError::InvalidValue(
                "guest_agent.poll_interval_ms",
                "must be nonzero when the poller is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
