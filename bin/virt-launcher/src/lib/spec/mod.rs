// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Converts VM specifications into domain definitions.
//!
//! Conversion is a pure function of the VM spec, the placement constraints,
//! and the set of registered mutators. Equal inputs always produce
//! byte-identical rendered definitions, which is what lets the lifecycle
//! controller skip redefinition when nothing has changed.

use std::collections::BTreeMap;

use domain_api_types::spec::{Arch, CpuSpec, CpuTopology, DiskBus};
use domain_api_types::{PlacementConstraints, VmSpec};
use thiserror::Error;

mod arch;
mod builder;
mod definition;
mod xml;

pub use definition::*;

use builder::DefinitionBuilder;

/// The smallest amount of memory a domain may be given.
pub const MIN_MEMORY_MIB: u64 = 64;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid domain name {0:?}")]
    InvalidName(String),

    #[error("requested {requested} vCPUs, must be between 1 and {max}")]
    VcpuCount { requested: u32, max: u32 },

    #[error("memory size {0} MiB is below the minimum")]
    MemoryTooSmall(u64),

    #[error("topology describes {topology} vCPUs but {vcpus} were requested")]
    TopologyMismatch { vcpus: u32, topology: u64 },

    #[error("placement constraints have an empty CPU set")]
    EmptyCpuset,

    #[error("vCPU {0} is pinned but does not exist")]
    PinnedVcpuOutOfRange(u32),

    #[error("vCPU {vcpu} is pinned to host CPU {host_cpu} outside the cpuset")]
    PinOutsideCpuset { vcpu: u32, host_cpu: u32 },

    #[error("dedicated vCPU {0} has no host CPU pin")]
    MissingVcpuPin(u32),

    #[error("emulator CPU set is not inside the domain's cpuset")]
    EmulatorOutsideCpuset,

    #[error("component name {0} is already in use")]
    ComponentNameInUse(String),

    #[error("PCI slot {0} is already in use")]
    PciSlotInUse(u8),

    #[error("PCI slot {0} is outside the usable range")]
    PciSlotOutOfRange(u8),

    #[error("no free PCI slots remain")]
    NoFreePciSlot,

    #[error("disk {disk} on bus {bus:?} cannot have a PCI slot")]
    SlotNotApplicable { disk: String, bus: DiskBus },

    #[error("MAC address {0} is already in use")]
    MacAddressInUse(String),

    #[error("invalid MAC address {0:?}")]
    InvalidMacAddress(String),

    #[error("boot order {0} is already in use")]
    BootOrderInUse(u32),

    #[error("no bootable disk or interface")]
    NoBootDevice,

    #[error("device {0:?} is specified more than once")]
    DuplicateDevice(AuxDeviceKind),

    #[error("firmware is not supported on {0:?}")]
    UnsupportedFirmware(Arch),

    #[error("device {device:?} is not supported on {arch:?}")]
    UnsupportedDevice { arch: Arch, device: AuxDeviceKind },

    #[error("definition names domain {found}, expected {expected}")]
    NameMismatch { expected: String, found: String },

    #[error("changes cannot be applied to a running domain: {0:?}")]
    LiveUpdateUnsupported(Vec<DefinitionChange>),

    #[error("definition mutator {name} failed: {error:#}")]
    Mutator { name: String, error: anyhow::Error },
}

/// A hook that may rewrite a draft definition after the built-in conversion.
///
/// Mutators must be deterministic: given equal drafts they must make equal
/// edits.
#[cfg_attr(test, mockall::automock)]
pub trait DefinitionMutator: Send + Sync {
    fn name(&self) -> &'static str;

    fn mutate(&self, definition: &mut DomainDefinition) -> anyhow::Result<()>;
}

/// Converts specs to definitions, applying registered mutators in order.
#[derive(Default)]
pub struct SpecConverter {
    mutators: Vec<Box<dyn DefinitionMutator>>,
}

impl std::fmt::Debug for SpecConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpecConverter")
            .field(
                "mutators",
                &self.mutators.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SpecConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mutator(mut self, mutator: Box<dyn DefinitionMutator>) -> Self {
        self.mutators.push(mutator);
        self
    }

    pub fn convert(
        &self,
        spec: &VmSpec,
        placement: &PlacementConstraints,
    ) -> Result<DomainDefinition, ValidationError> {
        validate_name(&spec.name)?;

        let defaults = arch::defaults_for(spec.arch);
        let firmware = arch::firmware_for(spec.arch, spec.firmware)?;

        let vcpus = spec.cpu.vcpus;
        if vcpus == 0 || vcpus > defaults.max_vcpus {
            return Err(ValidationError::VcpuCount {
                requested: vcpus,
                max: defaults.max_vcpus,
            });
        }

        let topology = match spec.cpu.topology {
            Some(topology) => {
                if topology.vcpus() != u64::from(vcpus) {
                    return Err(ValidationError::TopologyMismatch {
                        vcpus,
                        topology: topology.vcpus(),
                    });
                }
                topology
            }
            None => CpuTopology { sockets: vcpus, cores: 1, threads: 1 },
        };

        if spec.memory_mib < MIN_MEMORY_MIB {
            return Err(ValidationError::MemoryTooSmall(spec.memory_mib));
        }

        let cputune = resolve_cputune(&spec.cpu, placement)?;

        let mut builder = DefinitionBuilder::new(
            spec.name.clone(),
            spec.uuid,
            defaults,
            spec.arch,
            firmware,
        );
        builder.set_cpus(vcpus, topology, cputune).set_memory(
            spec.memory_mib,
            placement.numa_nodes.clone(),
            placement.cgroup_partition.clone(),
        );

        // Explicit slots are claimed before anything is placed automatically
        // so that automatic placement never takes a slot the VM asked for.
        for disk in &spec.disks {
            let bus = disk.bus.unwrap_or(defaults.disk_bus);
            if let (DiskBus::Virtio | DiskBus::Nvme, Some(slot)) =
                (bus, disk.pci_slot)
            {
                builder.reserve_slot(slot)?;
            }
        }
        for nic in &spec.interfaces {
            if let Some(slot) = nic.pci_slot {
                builder.reserve_slot(slot)?;
            }
        }

        // With no explicit boot order anywhere, the first disk boots.
        let implicit_boot = spec.disks.iter().all(|d| d.boot_order.is_none())
            && spec.interfaces.iter().all(|n| n.boot_order.is_none());

        for (i, disk) in spec.disks.iter().enumerate() {
            let boot_order = if implicit_boot && i == 0 {
                Some(1)
            } else {
                disk.boot_order
            };
            builder.add_disk(disk, boot_order)?;
        }

        for nic in &spec.interfaces {
            builder.add_interface(nic)?;
        }

        builder.add_aux_device(AuxDeviceKind::GuestAgentChannel)?;
        if spec
            .disks
            .iter()
            .any(|d| d.bus.unwrap_or(defaults.disk_bus) == DiskBus::Scsi)
        {
            builder.add_aux_device(AuxDeviceKind::ScsiController)?;
        }
        if spec.devices.serial_console {
            builder.add_aux_device(AuxDeviceKind::SerialConsole)?;
        }
        if spec.devices.rng {
            builder.add_aux_device(AuxDeviceKind::Rng)?;
        }
        if spec.devices.memory_balloon {
            builder.add_aux_device(AuxDeviceKind::MemoryBalloon)?;
        }
        if spec.devices.watchdog {
            if spec.arch == Arch::Aarch64 {
                return Err(ValidationError::UnsupportedDevice {
                    arch: spec.arch,
                    device: AuxDeviceKind::Watchdog,
                });
            }
            builder.add_aux_device(AuxDeviceKind::Watchdog)?;
        }

        if !builder.has_boot_device() {
            return Err(ValidationError::NoBootDevice);
        }

        let mut definition = builder.finish();
        for mutator in &self.mutators {
            mutator.mutate(&mut definition).map_err(|error| {
                ValidationError::Mutator {
                    name: mutator.name().to_owned(),
                    error,
                }
            })?;
        }

        if definition.name != spec.name {
            return Err(ValidationError::NameMismatch {
                expected: spec.name.clone(),
                found: definition.name,
            });
        }

        Ok(definition)
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(name.to_owned()))
    }
}

/// Merges pins from the placement constraints with the VM's explicit pins
/// and checks them against the placement's CPU set.
fn resolve_cputune(
    cpu: &CpuSpec,
    placement: &PlacementConstraints,
) -> Result<CpuTune, ValidationError> {
    let cpuset = &placement.cpuset;
    if cpuset.is_empty() {
        return Err(ValidationError::EmptyCpuset);
    }

    let mut pins: BTreeMap<u32, u32> = placement.vcpu_pins.clone();
    pins.extend(cpu.pinning.iter().map(|(&v, &h)| (v, h)));

    for (&vcpu, &host_cpu) in &pins {
        if vcpu >= cpu.vcpus {
            return Err(ValidationError::PinnedVcpuOutOfRange(vcpu));
        }
        if !cpuset.contains(&host_cpu) {
            return Err(ValidationError::PinOutsideCpuset { vcpu, host_cpu });
        }
    }

    if cpu.dedicated {
        if let Some(missing) = (0..cpu.vcpus).find(|v| !pins.contains_key(v)) {
            return Err(ValidationError::MissingVcpuPin(missing));
        }
    }

    let emulator_cpuset = if placement.emulator_cpuset.is_empty() {
        cpuset.clone()
    } else if placement.emulator_cpuset.is_subset(cpuset) {
        placement.emulator_cpuset.clone()
    } else {
        return Err(ValidationError::EmulatorOutsideCpuset);
    };

    Ok(CpuTune { vcpu_cpuset: cpuset.clone(), vcpu_pins: pins, emulator_cpuset })
}
