// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest metadata obtained from the in-guest agent.
//!
//! Field names follow the guest agent's wire format (kebab-case), so the
//! agent's JSON replies decode directly into these types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde_derive::{Deserialize, Serialize};

/// A kind of guest metadata. Each category is refreshed independently.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum GuestMetadataCategory {
    OsInfo,
    Filesystems,
    Interfaces,
    Users,
    Load,
    Hostname,
    Timezone,
}

impl GuestMetadataCategory {
    pub const ALL: [GuestMetadataCategory; 7] = [
        Self::OsInfo,
        Self::Filesystems,
        Self::Interfaces,
        Self::Users,
        Self::Load,
        Self::Hostname,
        Self::Timezone,
    ];

    /// The guest agent command that reports this category.
    pub fn command(&self) -> &'static str {
        match self {
            Self::OsInfo => "guest-get-osinfo",
            Self::Filesystems => "guest-get-fsinfo",
            Self::Interfaces => "guest-network-get-interfaces",
            Self::Users => "guest-get-users",
            Self::Load => "guest-get-load",
            Self::Hostname => "guest-get-host-name",
            Self::Timezone => "guest-get-timezone",
        }
    }
}

impl std::fmt::Display for GuestMetadataCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OsInfo => "os-info",
            Self::Filesystems => "filesystems",
            Self::Interfaces => "interfaces",
            Self::Users => "users",
            Self::Load => "load",
            Self::Hostname => "hostname",
            Self::Timezone => "timezone",
        };

        write!(f, "{}", s)
    }
}

#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
pub struct GuestOsInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pretty_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub kernel_release: Option<String>,
    #[serde(default)]
    pub kernel_version: Option<String>,
    #[serde(default)]
    pub machine: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GuestFilesystem {
    pub name: String,
    pub mountpoint: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub used_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GuestIpAddress {
    pub ip_address_type: String,
    pub ip_address: String,
    pub prefix: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct GuestInterface {
    pub name: String,
    #[serde(default)]
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GuestUser {
    pub user: String,
    #[serde(default)]
    pub domain: Option<String>,
    /// Login time in seconds since the Unix epoch.
    pub login_time: f64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GuestLoad {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GuestTimezone {
    #[serde(default)]
    pub zone: Option<String>,
    /// Offset from UTC in seconds.
    pub offset: i64,
}

/// A decoded guest agent reply for one metadata category.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case", tag = "category", content = "value")]
pub enum GuestInfo {
    OsInfo(GuestOsInfo),
    Filesystems(Vec<GuestFilesystem>),
    Interfaces(Vec<GuestInterface>),
    Users(Vec<GuestUser>),
    Load(GuestLoad),
    Hostname(String),
    Timezone(GuestTimezone),
}

impl GuestInfo {
    pub fn category(&self) -> GuestMetadataCategory {
        match self {
            Self::OsInfo(_) => GuestMetadataCategory::OsInfo,
            Self::Filesystems(_) => GuestMetadataCategory::Filesystems,
            Self::Interfaces(_) => GuestMetadataCategory::Interfaces,
            Self::Users(_) => GuestMetadataCategory::Users,
            Self::Load(_) => GuestMetadataCategory::Load,
            Self::Hostname(_) => GuestMetadataCategory::Hostname,
            Self::Timezone(_) => GuestMetadataCategory::Timezone,
        }
    }
}

/// How current a category's value is.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum CategoryStatus {
    /// No poll of this category has completed yet.
    NeverPolled,
    /// The most recent poll succeeded.
    Fresh,
    /// The most recent poll failed; the value, if any, is from an earlier
    /// successful poll.
    Stale(String),
    /// The guest agent does not implement the command for this category.
    Unsupported,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CategoryReport {
    pub category: GuestMetadataCategory,
    pub value: Option<GuestInfo>,
    /// When `value` was captured.
    pub captured_at: Option<DateTime<Utc>>,
    /// When the category was last polled, successfully or not.
    pub last_attempt: Option<DateTime<Utc>>,
    pub status: CategoryStatus,
    /// Set when the domain is not running. Values are then only a record of
    /// what the guest last reported.
    pub advisory: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GuestMetadataReport {
    pub categories: BTreeMap<GuestMetadataCategory, CategoryReport>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn os_info_decodes_agent_reply() {
        let reply = r#"{
            "name": "Debian GNU/Linux",
            "kernel-release": "6.1.0-18-amd64",
            "version": "12 (bookworm)",
            "pretty-name": "Debian GNU/Linux 12 (bookworm)",
            "version-id": "12",
            "kernel-version": "1 SMP PREEMPT_DYNAMIC",
            "machine": "x86_64",
            "id": "debian"
        }"#;
        let info: GuestOsInfo = serde_json::from_str(reply).unwrap();
        assert_eq!(info.id.as_deref(), Some("debian"));
        assert_eq!(info.kernel_release.as_deref(), Some("6.1.0-18-amd64"));
    }

    #[test]
    fn every_category_has_a_distinct_command() {
        let mut commands: Vec<_> = GuestMetadataCategory::ALL
            .iter()
            .map(|c| c.command())
            .collect();
        commands.sort_unstable();
        commands.dedup();
        assert_eq!(commands.len(), GuestMetadataCategory::ALL.len());
    }
}
