// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The declarative description of a virtual machine.
//!
//! A `VmSpec` arrives fully formed from the controller that owns it. The
//! launcher treats each version as an immutable value: it converts specs into
//! domain definitions but never edits them.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

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
pub enum Arch {
    X86_64,
    Aarch64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Firmware {
    Bios,
    Uefi {
        #[serde(default)]
        secure_boot: bool,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

impl CpuTopology {
    /// The number of vCPUs this topology describes.
    pub fn vcpus(&self) -> u64 {
        u64::from(self.sockets) * u64::from(self.cores) * u64::from(self.threads)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CpuSpec {
    pub vcpus: u32,

    /// An explicit guest CPU topology. If absent, every vCPU is presented as
    /// its own socket.
    #[serde(default)]
    pub topology: Option<CpuTopology>,

    /// Requests that each vCPU be pinned to its own host CPU.
    #[serde(default)]
    pub dedicated: bool,

    /// Explicit vCPU to host CPU pins. These override pins computed from the
    /// placement constraints but must stay inside the constraint's CPU set.
    #[serde(default)]
    pub pinning: BTreeMap<u32, u32>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum DiskBus {
    Virtio,
    Sata,
    Scsi,
    Nvme,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DiskSpec {
    pub name: String,

    /// Path to the disk image or block device on the host.
    pub source: String,

    /// The bus to attach the disk to. Defaults to the architecture's preferred
    /// bus.
    #[serde(default)]
    pub bus: Option<DiskBus>,

    #[serde(default)]
    pub read_only: bool,

    /// An explicit PCI slot on the root bus. Disks without one are assigned
    /// the first free slot.
    #[serde(default)]
    pub pci_slot: Option<u8>,

    #[serde(default)]
    pub boot_order: Option<u32>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceModel {
    Virtio,
    E1000,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum InterfaceSource {
    Bridge(String),
    Tap(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub name: String,
    pub mac: String,
    pub source: InterfaceSource,
    #[serde(default)]
    pub model: Option<InterfaceModel>,
    #[serde(default)]
    pub pci_slot: Option<u8>,
    #[serde(default)]
    pub boot_order: Option<u32>,
}

/// Auxiliary devices the guest should see.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub struct DeviceFlags {
    #[serde(default)]
    pub serial_console: bool,
    #[serde(default)]
    pub rng: bool,
    #[serde(default)]
    pub memory_balloon: bool,
    #[serde(default)]
    pub watchdog: bool,
}

/// What to do when a running domain's definition changes.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Apply the change to the running domain if the daemon supports it;
    /// otherwise stop, redefine, and restart the domain.
    #[default]
    LiveOrRestart,

    /// Apply the change to the running domain or reject it.
    LiveOnly,

    /// Always stop, redefine, and restart the domain.
    Restart,
}

#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub struct MigrationPolicy {
    /// Bandwidth cap for the migration stream, in MiB/s.
    #[serde(default)]
    pub bandwidth_mib_s: Option<u64>,

    #[serde(default)]
    pub allow_post_copy: bool,

    #[serde(default)]
    pub auto_converge: bool,

    #[serde(default)]
    pub compressed: bool,

    /// Overrides the launcher's configured migration deadline.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VmSpec {
    /// The domain name. A launcher only manages the domain with this name.
    pub name: String,
    pub uuid: Uuid,
    pub arch: Arch,
    pub firmware: Firmware,
    pub cpu: CpuSpec,
    pub memory_mib: u64,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
    #[serde(default)]
    pub devices: DeviceFlags,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default)]
    pub migration_policy: MigrationPolicy,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_spec_uses_defaults() {
        let json = r#"{
            "name": "vm0",
            "uuid": "7b4d2c8e-1f1a-4c1e-9d3f-0a2b3c4d5e6f",
            "arch": "x86_64",
            "firmware": { "type": "uefi" },
            "cpu": { "vcpus": 2 },
            "memory_mib": 1024
        }"#;

        let spec: VmSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.firmware, Firmware::Uefi { secure_boot: false });
        assert!(spec.disks.is_empty());
        assert_eq!(spec.update_policy, UpdatePolicy::LiveOrRestart);
        assert!(!spec.cpu.dedicated);
        assert_eq!(spec.migration_policy, MigrationPolicy::default());
    }

    #[test]
    fn interface_source_is_tagged() {
        let src: InterfaceSource =
            serde_json::from_str(r#"{"type":"bridge","name":"br0"}"#).unwrap();
        assert_eq!(src, InterfaceSource::Bridge("br0".to_owned()));
    }

    #[test]
    fn topology_vcpus() {
        let topo = CpuTopology { sockets: 2, cores: 4, threads: 2 };
        assert_eq!(topo.vcpus(), 16);
    }
}
