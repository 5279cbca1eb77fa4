// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The daemon-native domain definition produced by [`super::SpecConverter`].

use std::collections::{BTreeMap, BTreeSet};

use domain_api_types::spec::{
    Arch, CpuTopology, DiskBus, InterfaceModel, InterfaceSource,
};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// A device location on the guest's PCI root complex. Domain and function are
/// always zero.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord,
    Hash,
)]
pub struct PciAddress {
    pub bus: u8,
    pub slot: u8,
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0000:{:02x}:{:02x}.0", self.bus, self.slot)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    Bios,
    Efi,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FirmwareDefinition {
    pub kind: FirmwareKind,
    pub loader: Option<String>,
    pub nvram_template: Option<String>,
    pub secure_boot: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CpuTune {
    /// Host CPUs any unpinned vCPU may run on.
    pub vcpu_cpuset: BTreeSet<u32>,
    pub vcpu_pins: BTreeMap<u32, u32>,
    pub emulator_cpuset: BTreeSet<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskDefinition {
    pub name: String,
    pub source: String,
    pub bus: DiskBus,
    /// The guest-visible target device, e.g. `vda`.
    pub target_dev: String,
    pub read_only: bool,
    /// PCI location, for buses whose disks are PCI functions.
    pub address: Option<PciAddress>,
    pub boot_order: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InterfaceDefinition {
    pub name: String,
    pub mac: String,
    pub source: InterfaceSource,
    pub model: InterfaceModel,
    pub address: PciAddress,
    pub boot_order: Option<u32>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuxDeviceKind {
    /// The virtio-serial controller carrying the guest agent channel.
    GuestAgentChannel,
    /// Present whenever any disk sits on the SCSI bus.
    ScsiController,
    SerialConsole,
    Rng,
    MemoryBalloon,
    Watchdog,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuxDevice {
    pub kind: AuxDeviceKind,
    pub address: Option<PciAddress>,
}

/// A domain definition ready to hand to the daemon.
///
/// Definitions are compared by their rendered document (see
/// [`DomainDefinition::render`]), so every collection in here has a
/// deterministic order.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DomainDefinition {
    pub name: String,
    pub uuid: Uuid,
    pub arch: Arch,
    pub machine: String,
    pub emulator: String,
    pub firmware: FirmwareDefinition,
    pub vcpus: u32,
    pub topology: CpuTopology,
    pub cputune: CpuTune,
    pub memory_mib: u64,
    pub numa_nodes: BTreeSet<u32>,
    pub partition: Option<String>,
    pub disks: Vec<DiskDefinition>,
    pub interfaces: Vec<InterfaceDefinition>,
    pub devices: Vec<AuxDevice>,
}

/// A section of a domain definition that differs between two versions.
#[derive(
    Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case", tag = "section", content = "name")]
pub enum DefinitionChange {
    /// Name, UUID, architecture, machine type, or emulator changed. These
    /// can never be applied to a running domain.
    Identity,
    Firmware,
    Vcpus,
    Topology,
    Memory,
    Placement,
    Disk(String),
    Interface(String),
    Devices,
    /// The previous definition is not known in structured form.
    Unknown,
}

impl DefinitionChange {
    /// Changes a daemon may be able to apply to a running domain. Whether it
    /// actually can is the daemon's decision.
    pub fn may_apply_live(&self) -> bool {
        matches!(
            self,
            Self::Vcpus
                | Self::Memory
                | Self::Placement
                | Self::Disk(_)
                | Self::Interface(_)
        )
    }
}

impl DomainDefinition {
    /// Lists the sections that differ between `self` and `new`, in a stable
    /// order.
    pub fn diff(&self, new: &DomainDefinition) -> Vec<DefinitionChange> {
        let mut changes = BTreeSet::new();

        if self.name != new.name
            || self.uuid != new.uuid
            || self.arch != new.arch
            || self.machine != new.machine
            || self.emulator != new.emulator
        {
            changes.insert(DefinitionChange::Identity);
        }

        if self.firmware != new.firmware {
            changes.insert(DefinitionChange::Firmware);
        }

        if self.vcpus != new.vcpus {
            changes.insert(DefinitionChange::Vcpus);
        }

        if self.topology != new.topology {
            changes.insert(DefinitionChange::Topology);
        }

        if self.memory_mib != new.memory_mib {
            changes.insert(DefinitionChange::Memory);
        }

        if self.cputune != new.cputune
            || self.numa_nodes != new.numa_nodes
            || self.partition != new.partition
        {
            changes.insert(DefinitionChange::Placement);
        }

        let old_disks: BTreeMap<_, _> =
            self.disks.iter().map(|d| (d.name.as_str(), d)).collect();
        let new_disks: BTreeMap<_, _> =
            new.disks.iter().map(|d| (d.name.as_str(), d)).collect();
        for name in old_disks.keys().chain(new_disks.keys()) {
            if old_disks.get(name) != new_disks.get(name) {
                changes.insert(DefinitionChange::Disk(name.to_string()));
            }
        }

        let old_nics: BTreeMap<_, _> =
            self.interfaces.iter().map(|n| (n.name.as_str(), n)).collect();
        let new_nics: BTreeMap<_, _> =
            new.interfaces.iter().map(|n| (n.name.as_str(), n)).collect();
        for name in old_nics.keys().chain(new_nics.keys()) {
            if old_nics.get(name) != new_nics.get(name) {
                changes.insert(DefinitionChange::Interface(name.to_string()));
            }
        }

        if self.devices != new.devices {
            changes.insert(DefinitionChange::Devices);
        }

        changes.into_iter().collect()
    }
}
