// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A builder for domain definitions.

use std::collections::{BTreeMap, BTreeSet};

use domain_api_types::spec::{
    CpuTopology, DiskBus, DiskSpec, InterfaceSpec,
};
use uuid::Uuid;

use super::arch::ArchDefaults;
use super::definition::{
    AuxDevice, AuxDeviceKind, CpuTune, DiskDefinition, DomainDefinition,
    FirmwareDefinition, InterfaceDefinition, PciAddress,
};
use super::ValidationError;

#[derive(Debug)]
pub(crate) struct DefinitionBuilder {
    def: DomainDefinition,
    defaults: &'static ArchDefaults,
    pci_slots: BTreeSet<u8>,
    component_names: BTreeSet<String>,
    macs: BTreeSet<String>,
    boot_orders: BTreeSet<u32>,
    next_target_index: BTreeMap<&'static str, u32>,
}

impl DefinitionBuilder {
    pub(super) fn new(
        name: String,
        uuid: Uuid,
        defaults: &'static ArchDefaults,
        arch: domain_api_types::spec::Arch,
        firmware: FirmwareDefinition,
    ) -> Self {
        Self {
            def: DomainDefinition {
                name,
                uuid,
                arch,
                machine: defaults.machine.to_owned(),
                emulator: defaults.emulator.to_owned(),
                firmware,
                vcpus: 0,
                topology: CpuTopology { sockets: 0, cores: 0, threads: 0 },
                cputune: CpuTune::default(),
                memory_mib: 0,
                numa_nodes: BTreeSet::new(),
                partition: None,
                disks: Vec::new(),
                interfaces: Vec::new(),
                devices: Vec::new(),
            },
            defaults,
            pci_slots: BTreeSet::new(),
            component_names: BTreeSet::new(),
            macs: BTreeSet::new(),
            boot_orders: BTreeSet::new(),
            next_target_index: BTreeMap::new(),
        }
    }

    pub(super) fn set_cpus(
        &mut self,
        vcpus: u32,
        topology: CpuTopology,
        cputune: CpuTune,
    ) -> &mut Self {
        self.def.vcpus = vcpus;
        self.def.topology = topology;
        self.def.cputune = cputune;
        self
    }

    pub(super) fn set_memory(
        &mut self,
        memory_mib: u64,
        numa_nodes: BTreeSet<u32>,
        partition: Option<String>,
    ) -> &mut Self {
        self.def.memory_mib = memory_mib;
        self.def.numa_nodes = numa_nodes;
        self.def.partition = partition;
        self
    }

    /// Claims a specific slot on the root bus. Explicit slots must all be
    /// reserved before any device is placed automatically.
    pub(super) fn reserve_slot(&mut self, slot: u8) -> Result<(), ValidationError> {
        if slot < self.defaults.first_free_slot || slot > self.defaults.last_slot
        {
            return Err(ValidationError::PciSlotOutOfRange(slot));
        }

        if !self.pci_slots.insert(slot) {
            return Err(ValidationError::PciSlotInUse(slot));
        }

        Ok(())
    }

    fn next_free_slot(&mut self) -> Result<PciAddress, ValidationError> {
        let slot = (self.defaults.first_free_slot..=self.defaults.last_slot)
            .find(|s| !self.pci_slots.contains(s))
            .ok_or(ValidationError::NoFreePciSlot)?;
        self.pci_slots.insert(slot);
        Ok(PciAddress { bus: 0, slot })
    }

    fn register_name(&mut self, name: &str) -> Result<(), ValidationError> {
        if !self.component_names.insert(name.to_owned()) {
            return Err(ValidationError::ComponentNameInUse(name.to_owned()));
        }
        Ok(())
    }

    fn register_boot_order(
        &mut self,
        order: Option<u32>,
    ) -> Result<(), ValidationError> {
        if let Some(order) = order {
            if !self.boot_orders.insert(order) {
                return Err(ValidationError::BootOrderInUse(order));
            }
        }
        Ok(())
    }

    fn next_target_dev(&mut self, bus: DiskBus) -> String {
        let prefix = match bus {
            DiskBus::Virtio => "vd",
            DiskBus::Sata | DiskBus::Scsi => "sd",
            DiskBus::Nvme => "nvme",
        };

        let index = self.next_target_index.entry(prefix).or_insert(0);
        let this = *index;
        *index += 1;

        match bus {
            DiskBus::Nvme => format!("nvme{}n1", this),
            _ => format!("{}{}", prefix, drive_letters(this)),
        }
    }

    /// Adds a disk. The disk's explicit slot, if any, must already be
    /// reserved.
    pub(super) fn add_disk(
        &mut self,
        disk: &DiskSpec,
        boot_order: Option<u32>,
    ) -> Result<&Self, ValidationError> {
        self.register_name(&disk.name)?;
        self.register_boot_order(boot_order)?;

        let bus = disk.bus.unwrap_or(self.defaults.disk_bus);
        let address = match (bus, disk.pci_slot) {
            (DiskBus::Virtio | DiskBus::Nvme, Some(slot)) => {
                Some(PciAddress { bus: 0, slot })
            }
            (DiskBus::Virtio | DiskBus::Nvme, None) => {
                Some(self.next_free_slot()?)
            }
            (DiskBus::Sata | DiskBus::Scsi, Some(_)) => {
                return Err(ValidationError::SlotNotApplicable {
                    disk: disk.name.clone(),
                    bus,
                });
            }
            (DiskBus::Sata | DiskBus::Scsi, None) => None,
        };

        let target_dev = self.next_target_dev(bus);
        self.def.disks.push(DiskDefinition {
            name: disk.name.clone(),
            source: disk.source.clone(),
            bus,
            target_dev,
            read_only: disk.read_only,
            address,
            boot_order,
        });
        Ok(self)
    }

    pub(super) fn add_interface(
        &mut self,
        nic: &InterfaceSpec,
    ) -> Result<&Self, ValidationError> {
        self.register_name(&nic.name)?;
        let mac = normalize_mac(&nic.mac)?;
        if !self.macs.insert(mac.clone()) {
            return Err(ValidationError::MacAddressInUse(mac));
        }
        self.register_boot_order(nic.boot_order)?;

        let address = match nic.pci_slot {
            Some(slot) => PciAddress { bus: 0, slot },
            None => self.next_free_slot()?,
        };

        self.def.interfaces.push(InterfaceDefinition {
            name: nic.name.clone(),
            mac,
            source: nic.source.clone(),
            model: nic.model.unwrap_or(self.defaults.interface_model),
            address,
            boot_order: nic.boot_order,
        });
        Ok(self)
    }

    /// Adds an auxiliary device. Devices that live on the PCI bus get the
    /// next free slot.
    pub(super) fn add_aux_device(
        &mut self,
        kind: AuxDeviceKind,
    ) -> Result<&Self, ValidationError> {
        if self.def.devices.iter().any(|d| d.kind == kind) {
            return Err(ValidationError::DuplicateDevice(kind));
        }

        let address = match kind {
            AuxDeviceKind::SerialConsole => None,
            AuxDeviceKind::GuestAgentChannel
            | AuxDeviceKind::ScsiController
            | AuxDeviceKind::Rng
            | AuxDeviceKind::MemoryBalloon
            | AuxDeviceKind::Watchdog => Some(self.next_free_slot()?),
        };

        self.def.devices.push(AuxDevice { kind, address });
        Ok(self)
    }

    pub(super) fn has_boot_device(&self) -> bool {
        !self.boot_orders.is_empty()
    }

    /// Yields the completed definition, consuming the builder.
    pub fn finish(self) -> DomainDefinition {
        self.def
    }
}

/// Converts a zero-based drive index to the letter suffix used by
/// conventional device names: 0 -> "a", 25 -> "z", 26 -> "aa".
fn drive_letters(mut index: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'a' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Validates a MAC address and renders it in lowercase colon-separated form.
fn normalize_mac(mac: &str) -> Result<String, ValidationError> {
    let octets: Vec<&str> = mac.split([':', '-']).collect();
    if octets.len() != 6
        || !octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Err(ValidationError::InvalidMacAddress(mac.to_owned()));
    }

    // The low bit of the first octet marks a multicast address, which no
    // NIC may own.
    let first = u8::from_str_radix(octets[0], 16)
        .map_err(|_| ValidationError::InvalidMacAddress(mac.to_owned()))?;
    if first & 1 != 0 {
        return Err(ValidationError::InvalidMacAddress(mac.to_owned()));
    }

    Ok(octets.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod test {
    use domain_api_types::spec::{Arch, InterfaceSource};

    use super::super::arch::{defaults_for, firmware_for};
    use super::*;

    fn test_builder() -> DefinitionBuilder {
        DefinitionBuilder::new(
            "vm0".to_owned(),
            Uuid::nil(),
            defaults_for(Arch::X86_64),
            Arch::X86_64,
            firmware_for(Arch::X86_64, domain_api_types::spec::Firmware::Bios)
                .unwrap(),
        )
    }

    fn disk(name: &str, bus: Option<DiskBus>, slot: Option<u8>) -> DiskSpec {
        DiskSpec {
            name: name.to_owned(),
            source: format!("/var/lib/images/{}.qcow2", name),
            bus,
            read_only: false,
            pci_slot: slot,
            boot_order: None,
        }
    }

    fn nic(name: &str, mac: &str) -> InterfaceSpec {
        InterfaceSpec {
            name: name.to_owned(),
            mac: mac.to_owned(),
            source: InterfaceSource::Bridge("br0".to_owned()),
            model: None,
            pci_slot: None,
            boot_order: None,
        }
    }

    #[test]
    fn builder_debug_includes_arch_defaults() {
        let shown = format!("{:?}", test_builder());
        assert!(shown.contains("q35"));
        assert!(shown.contains("max_vcpus"));
    }

    #[test]
    fn duplicate_pci_slot() {
        let mut builder = test_builder();
        assert!(builder.reserve_slot(4).is_ok());
        assert!(matches!(
            builder.reserve_slot(4),
            Err(ValidationError::PciSlotInUse(4))
        ));
        assert!(matches!(
            builder.reserve_slot(0),
            Err(ValidationError::PciSlotOutOfRange(0))
        ));
    }

    #[test]
    fn automatic_slots_skip_reserved_ones() {
        let mut builder = test_builder();
        builder.reserve_slot(2).unwrap();
        builder.add_disk(&disk("root", None, None), Some(1)).unwrap();
        builder.add_disk(&disk("data", None, Some(2)), None).unwrap();
        let def = builder.finish();
        assert_eq!(def.disks[0].address, Some(PciAddress { bus: 0, slot: 3 }));
        assert_eq!(def.disks[0].target_dev, "vda");
        assert_eq!(def.disks[1].address, Some(PciAddress { bus: 0, slot: 2 }));
        assert_eq!(def.disks[1].target_dev, "vdb");
    }

    #[test]
    fn duplicate_component_names() {
        let mut builder = test_builder();
        builder.add_disk(&disk("disk0", None, None), None).unwrap();
        assert!(matches!(
            builder.add_interface(&nic("disk0", "52:54:00:00:00:01")),
            Err(ValidationError::ComponentNameInUse(_))
        ));
    }

    #[test]
    fn duplicate_and_malformed_macs() {
        let mut builder = test_builder();
        builder.add_interface(&nic("net0", "52:54:00:AA:BB:01")).unwrap();
        assert!(matches!(
            builder.add_interface(&nic("net1", "52-54-00-aa-bb-01")),
            Err(ValidationError::MacAddressInUse(_))
        ));
        assert!(matches!(
            builder.add_interface(&nic("net2", "52:54:00:aa:bb")),
            Err(ValidationError::InvalidMacAddress(_))
        ));
        assert!(matches!(
            builder.add_interface(&nic("net3", "01:00:5e:00:00:01")),
            Err(ValidationError::InvalidMacAddress(_))
        ));
    }

    #[test]
    fn sata_disks_have_no_pci_address() {
        let mut builder = test_builder();
        builder.add_disk(&disk("cd", Some(DiskBus::Sata), None), None).unwrap();
        assert!(builder
            .add_disk(&disk("cd2", Some(DiskBus::Sata), Some(5)), None)
            .is_err());
        let def = builder.finish();
        assert_eq!(def.disks[0].address, None);
        assert_eq!(def.disks[0].target_dev, "sda");
    }

    #[test]
    fn duplicate_boot_order() {
        let mut builder = test_builder();
        builder.add_disk(&disk("a", None, None), Some(1)).unwrap();
        assert!(matches!(
            builder.add_disk(&disk("b", None, None), Some(1)),
            Err(ValidationError::BootOrderInUse(1))
        ));
    }

    #[test]
    fn drive_letter_sequence() {
        assert_eq!(drive_letters(0), "a");
        assert_eq!(drive_letters(25), "z");
        assert_eq!(drive_letters(26), "aa");
        assert_eq!(drive_letters(27), "ab");
        assert_eq!(drive_letters(701), "zz");
        assert_eq!(drive_letters(702), "aaa");
    }
}
