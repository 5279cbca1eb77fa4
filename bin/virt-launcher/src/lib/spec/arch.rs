// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-architecture defaults applied before any spec-specific field.

use domain_api_types::spec::{Arch, DiskBus, Firmware, InterfaceModel};

use super::definition::{FirmwareDefinition, FirmwareKind};
use super::ValidationError;

#[derive(Debug)]
pub(super) struct ArchDefaults {
    pub machine: &'static str,
    pub emulator: &'static str,
    pub disk_bus: DiskBus,
    pub interface_model: InterfaceModel,

    /// The lowest root-bus slot available for automatically placed devices.
    pub first_free_slot: u8,

    /// The highest usable slot on the root bus.
    pub last_slot: u8,
    pub max_vcpus: u32,
}

const X86_64: ArchDefaults = ArchDefaults {
    machine: "q35",
    emulator: "/usr/bin/qemu-system-x86_64",
    disk_bus: DiskBus::Virtio,
    interface_model: InterfaceModel::Virtio,
    first_free_slot: 2,
    last_slot: 31,
    max_vcpus: 512,
};

const AARCH64: ArchDefaults = ArchDefaults {
    machine: "virt",
    emulator: "/usr/bin/qemu-system-aarch64",
    disk_bus: DiskBus::Virtio,
    interface_model: InterfaceModel::Virtio,
    first_free_slot: 1,
    last_slot: 31,
    max_vcpus: 512,
};

pub(super) fn defaults_for(arch: Arch) -> &'static ArchDefaults {
    match arch {
        Arch::X86_64 => &X86_64,
        Arch::Aarch64 => &AARCH64,
    }
}

/// Resolves the firmware loader for an architecture.
///
/// aarch64 guests have no legacy BIOS, so they must boot with UEFI.
pub(super) fn firmware_for(
    arch: Arch,
    firmware: Firmware,
) -> Result<FirmwareDefinition, ValidationError> {
    match (arch, firmware) {
        (Arch::X86_64, Firmware::Bios) => Ok(FirmwareDefinition {
            kind: FirmwareKind::Bios,
            loader: None,
            nvram_template: None,
            secure_boot: false,
        }),
        (Arch::X86_64, Firmware::Uefi { secure_boot }) => {
            let (loader, vars) = if secure_boot {
                (
                    "/usr/share/OVMF/OVMF_CODE.secboot.fd",
                    "/usr/share/OVMF/OVMF_VARS.secboot.fd",
                )
            } else {
                ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd")
            };
            Ok(FirmwareDefinition {
                kind: FirmwareKind::Efi,
                loader: Some(loader.to_owned()),
                nvram_template: Some(vars.to_owned()),
                secure_boot,
            })
        }
        (Arch::Aarch64, Firmware::Bios) => {
            Err(ValidationError::UnsupportedFirmware(arch))
        }
        (Arch::Aarch64, Firmware::Uefi { secure_boot: true }) => {
            Err(ValidationError::UnsupportedFirmware(arch))
        }
        (Arch::Aarch64, Firmware::Uefi { secure_boot: false }) => {
            Ok(FirmwareDefinition {
                kind: FirmwareKind::Efi,
                loader: Some("/usr/share/AAVMF/AAVMF_CODE.fd".to_owned()),
                nvram_template: Some(
                    "/usr/share/AAVMF/AAVMF_VARS.fd".to_owned(),
                ),
                secure_boot: false,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aarch64_requires_plain_uefi() {
        assert!(firmware_for(Arch::Aarch64, Firmware::Bios).is_err());
        assert!(firmware_for(Arch::Aarch64, Firmware::Uefi { secure_boot: true })
            .is_err());
        let fw =
            firmware_for(Arch::Aarch64, Firmware::Uefi { secure_boot: false })
                .unwrap();
        assert_eq!(fw.kind, FirmwareKind::Efi);
        assert!(fw.loader.unwrap().contains("AAVMF"));
    }

    #[test]
    fn x86_secure_boot_uses_signed_loader() {
        let fw =
            firmware_for(Arch::X86_64, Firmware::Uefi { secure_boot: true })
                .unwrap();
        assert!(fw.secure_boot);
        assert!(fw.loader.unwrap().ends_with("secboot.fd"));
        assert_eq!(defaults_for(Arch::X86_64).machine, "q35");
        assert_eq!(defaults_for(Arch::Aarch64).first_free_slot, 1);
    }

    #[test]
    fn defaults_are_printable() {
        let shown = format!("{:?}", defaults_for(Arch::Aarch64));
        assert!(shown.contains("virt"));
        assert!(shown.contains("first_free_slot: 1"));
    }
}
