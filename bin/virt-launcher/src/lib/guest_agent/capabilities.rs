// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The set of commands a guest agent instance implements.

use std::collections::BTreeSet;

use domain_api_types::guest::GuestMetadataCategory;
use serde_derive::Deserialize;

/// The command that reports an agent's version and command set.
pub const GUEST_INFO: &str = "guest-info";

#[derive(Deserialize)]
struct GuestInfoReply {
    version: String,
    supported_commands: Vec<SupportedCommand>,
}

#[derive(Deserialize)]
struct SupportedCommand {
    name: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// The capabilities negotiated with one agent connection.
///
/// `epoch` identifies the connection. When the agent reconnects (for
/// example after it is restarted inside the guest) the epoch changes and
/// capabilities must be negotiated again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub epoch: u64,
    pub version: String,
    enabled: BTreeSet<String>,
}

impl Capabilities {
    /// Parses a `guest-info` reply. Commands the agent lists as disabled
    /// are treated as unsupported.
    pub fn from_guest_info(
        epoch: u64,
        reply: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let reply: GuestInfoReply = serde_json::from_value(reply)?;
        let enabled = reply
            .supported_commands
            .into_iter()
            .filter(|c| c.enabled)
            .map(|c| c.name)
            .collect();

        Ok(Self { epoch, version: reply.version, enabled })
    }

    pub fn supports(&self, category: GuestMetadataCategory) -> bool {
        self.enabled.contains(category.command())
    }

    /// Records that the agent rejected `category`'s command as unknown
    /// despite advertising it.
    pub fn revoke(&mut self, category: GuestMetadataCategory) {
        self.enabled.remove(category.command());
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn disabled_commands_are_unsupported() {
        let reply = json!({
            "version": "8.2.0",
            "supported_commands": [
                { "name": "guest-get-osinfo", "enabled": true,
                  "success-response": true },
                { "name": "guest-get-fsinfo", "enabled": false,
                  "success-response": true },
                { "name": "guest-get-load" },
            ]
        });

        let caps = Capabilities::from_guest_info(3, reply).unwrap();
        assert_eq!(caps.epoch, 3);
        assert_eq!(caps.version, "8.2.0");
        assert!(caps.supports(GuestMetadataCategory::OsInfo));
        assert!(caps.supports(GuestMetadataCategory::Load));
        assert!(!caps.supports(GuestMetadataCategory::Filesystems));
        assert!(!caps.supports(GuestMetadataCategory::Users));
    }

    #[test]
    fn revoke_removes_command() {
        let reply = json!({
            "version": "7.0",
            "supported_commands": [{ "name": "guest-get-users" }]
        });
        let mut caps = Capabilities::from_guest_info(1, reply).unwrap();
        caps.revoke(GuestMetadataCategory::Users);
        assert!(!caps.supports(GuestMetadataCategory::Users));
    }

    #[test]
    fn malformed_reply_is_rejected() {
        assert!(Capabilities::from_guest_info(1, json!({ "version": 3 }))
            .is_err());
    }
}
