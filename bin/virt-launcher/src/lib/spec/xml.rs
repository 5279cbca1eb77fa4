// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Renders domain definitions as daemon XML documents.

use std::collections::BTreeSet;
use std::fmt::{self, Write};

use domain_api_types::spec::{Arch, DiskBus, InterfaceModel, InterfaceSource};

use super::definition::{
    AuxDeviceKind, DomainDefinition, FirmwareKind, PciAddress,
};

impl DomainDefinition {
    /// Renders the definition document handed to the daemon.
    ///
    /// The output depends only on the definition's contents. Two definitions
    /// render identically if and only if they are equal.
    pub fn render(&self) -> String {
        DomainXml(self).to_string()
    }
}

struct DomainXml<'a>(&'a DomainDefinition);

/// Escapes text for use in XML attribute values and character data.
struct Escaped<'a>(&'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '&' => f.write_str("&amp;")?,
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                c => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

/// Formats a CPU set in the compact range syntax, e.g. `0-3,8,10-11`.
struct CpuList<'a>(&'a BTreeSet<u32>);

impl fmt::Display for CpuList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.0.iter().copied().peekable();
        let mut first = true;
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }

            if !first {
                f.write_char(',')?;
            }
            first = false;

            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

fn pci_address(f: &mut fmt::Formatter<'_>, addr: &PciAddress) -> fmt::Result {
    writeln!(
        f,
        "      <address type='pci' domain='0x0000' bus='0x{:02x}' slot='0x{:02x}' function='0x0'/>",
        addr.bus, addr.slot
    )
}

impl fmt::Display for DomainXml<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let def = self.0;
        let arch = match def.arch {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        };

        writeln!(f, "<domain type='kvm'>")?;
        writeln!(f, "  <name>{}</name>", Escaped(&def.name))?;
        writeln!(f, "  <uuid>{}</uuid>", def.uuid)?;
        writeln!(f, "  <memory unit='MiB'>{}</memory>", def.memory_mib)?;
        let tune = &def.cputune;
        if tune.vcpu_cpuset.is_empty() {
            writeln!(f, "  <vcpu placement='static'>{}</vcpu>", def.vcpus)?;
        } else {
            writeln!(
                f,
                "  <vcpu placement='static' cpuset='{}'>{}</vcpu>",
                CpuList(&tune.vcpu_cpuset),
                def.vcpus
            )?;
        }

        writeln!(f, "  <cputune>")?;
        for (vcpu, host) in &tune.vcpu_pins {
            writeln!(f, "    <vcpupin vcpu='{}' cpuset='{}'/>", vcpu, host)?;
        }
        if !tune.emulator_cpuset.is_empty() {
            writeln!(
                f,
                "    <emulatorpin cpuset='{}'/>",
                CpuList(&tune.emulator_cpuset)
            )?;
        }
        writeln!(f, "  </cputune>")?;

        if !def.numa_nodes.is_empty() {
            writeln!(f, "  <numatune>")?;
            writeln!(
                f,
                "    <memory mode='strict' nodeset='{}'/>",
                CpuList(&def.numa_nodes)
            )?;
            writeln!(f, "  </numatune>")?;
        }

        if let Some(partition) = &def.partition {
            writeln!(f, "  <resource>")?;
            writeln!(f, "    <partition>{}</partition>", Escaped(partition))?;
            writeln!(f, "  </resource>")?;
        }

        match def.firmware.kind {
            FirmwareKind::Bios => writeln!(f, "  <os>")?,
            FirmwareKind::Efi => writeln!(f, "  <os firmware='efi'>")?,
        }
        writeln!(
            f,
            "    <type arch='{}' machine='{}'>hvm</type>",
            arch,
            Escaped(&def.machine)
        )?;
        if let Some(loader) = &def.firmware.loader {
            writeln!(
                f,
                "    <loader readonly='yes' secure='{}' type='pflash'>{}</loader>",
                if def.firmware.secure_boot { "yes" } else { "no" },
                Escaped(loader)
            )?;
        }
        if let Some(template) = &def.firmware.nvram_template {
            writeln!(f, "    <nvram template='{}'/>", Escaped(template))?;
        }
        writeln!(f, "  </os>")?;

        writeln!(f, "  <features>")?;
        writeln!(f, "    <acpi/>")?;
        if def.firmware.secure_boot {
            writeln!(f, "    <smm state='on'/>")?;
        }
        writeln!(f, "  </features>")?;

        writeln!(
            f,
            "  <cpu mode='host-passthrough' check='none'>\n    <topology sockets='{}' dies='1' cores='{}' threads='{}'/>\n  </cpu>",
            def.topology.sockets, def.topology.cores, def.topology.threads
        )?;

        writeln!(f, "  <on_poweroff>destroy</on_poweroff>")?;
        writeln!(f, "  <on_reboot>restart</on_reboot>")?;
        writeln!(f, "  <on_crash>destroy</on_crash>")?;

        writeln!(f, "  <devices>")?;
        writeln!(f, "    <emulator>{}</emulator>", Escaped(&def.emulator))?;

        for disk in &def.disks {
            let bus = match disk.bus {
                DiskBus::Virtio => "virtio",
                DiskBus::Sata => "sata",
                DiskBus::Scsi => "scsi",
                DiskBus::Nvme => "nvme",
            };
            let is_device = disk.source.starts_with("/dev/");
            writeln!(
                f,
                "    <disk type='{}' device='disk'>",
                if is_device { "block" } else { "file" }
            )?;
            writeln!(f, "      <alias name='ua-{}'/>", Escaped(&disk.name))?;
            writeln!(
                f,
                "      <source {}='{}'/>",
                if is_device { "dev" } else { "file" },
                Escaped(&disk.source)
            )?;
            writeln!(
                f,
                "      <target dev='{}' bus='{}'/>",
                disk.target_dev, bus
            )?;
            if disk.read_only {
                writeln!(f, "      <readonly/>")?;
            }
            if let Some(order) = disk.boot_order {
                writeln!(f, "      <boot order='{}'/>", order)?;
            }
            if let Some(addr) = &disk.address {
                pci_address(f, addr)?;
            }
            writeln!(f, "    </disk>")?;
        }

        for nic in &def.interfaces {
            let (kind, source) = match &nic.source {
                InterfaceSource::Bridge(name) => ("bridge", format!("bridge='{}'", Escaped(name))),
                InterfaceSource::Tap(name) => ("ethernet", format!("dev='{}'", Escaped(name))),
            };
            let model = match nic.model {
                InterfaceModel::Virtio => "virtio",
                InterfaceModel::E1000 => "e1000",
            };
            writeln!(f, "    <interface type='{}'>", kind)?;
            writeln!(f, "      <alias name='ua-{}'/>", Escaped(&nic.name))?;
            writeln!(f, "      <mac address='{}'/>", nic.mac)?;
            match &nic.source {
                InterfaceSource::Bridge(_) => {
                    writeln!(f, "      <source {}/>", source)?
                }
                InterfaceSource::Tap(_) => {
                    writeln!(f, "      <target {} managed='no'/>", source)?
                }
            }
            writeln!(f, "      <model type='{}'/>", model)?;
            if let Some(order) = nic.boot_order {
                writeln!(f, "      <boot order='{}'/>", order)?;
            }
            pci_address(f, &nic.address)?;
            writeln!(f, "    </interface>")?;
        }

        for dev in &def.devices {
            match dev.kind {
                AuxDeviceKind::GuestAgentChannel => {
                    writeln!(f, "    <controller type='virtio-serial' index='0'>")?;
                    if let Some(addr) = &dev.address {
                        pci_address(f, addr)?;
                    }
                    writeln!(f, "    </controller>")?;
                    writeln!(f, "    <channel type='unix'>")?;
                    writeln!(
                        f,
                        "      <target type='virtio' name='org.qemu.guest_agent.0'/>"
                    )?;
                    writeln!(f, "    </channel>")?;
                }
                AuxDeviceKind::ScsiController => {
                    writeln!(
                        f,
                        "    <controller type='scsi' index='0' model='virtio-scsi'>"
                    )?;
                    if let Some(addr) = &dev.address {
                        pci_address(f, addr)?;
                    }
                    writeln!(f, "    </controller>")?;
                }
                AuxDeviceKind::SerialConsole => {
                    writeln!(f, "    <serial type='pty'>")?;
                    writeln!(f, "      <target port='0'/>")?;
                    writeln!(f, "    </serial>")?;
                    writeln!(f, "    <console type='pty'>")?;
                    writeln!(f, "      <target type='serial' port='0'/>")?;
                    writeln!(f, "    </console>")?;
                }
                AuxDeviceKind::Rng => {
                    writeln!(f, "    <rng model='virtio'>")?;
                    writeln!(f, "      <backend model='random'>/dev/urandom</backend>")?;
                    if let Some(addr) = &dev.address {
                        pci_address(f, addr)?;
                    }
                    writeln!(f, "    </rng>")?;
                }
                AuxDeviceKind::MemoryBalloon => {
                    writeln!(f, "    <memballoon model='virtio'>")?;
                    if let Some(addr) = &dev.address {
                        pci_address(f, addr)?;
                    }
                    writeln!(f, "    </memballoon>")?;
                }
                AuxDeviceKind::Watchdog => {
                    writeln!(f, "    <watchdog model='i6300esb' action='reset'>")?;
                    if let Some(addr) = &dev.address {
                        pci_address(f, addr)?;
                    }
                    writeln!(f, "    </watchdog>")?;
                }
            }
        }

        // Without an explicit balloon the daemon adds one of its own, which
        // would make the daemon's copy of the definition differ from ours.
        if !def.devices.iter().any(|d| d.kind == AuxDeviceKind::MemoryBalloon) {
            writeln!(f, "    <memballoon model='none'/>")?;
        }

        writeln!(f, "  </devices>")?;
        write!(f, "</domain>")
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{test_placement, test_spec};
    use super::super::SpecConverter;
    use super::*;

    #[test]
    fn cpu_list_ranges() {
        let set = BTreeSet::from([0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(CpuList(&set).to_string(), "0-3,8,10-11");
        assert_eq!(CpuList(&BTreeSet::from([5])).to_string(), "5");
        assert_eq!(CpuList(&BTreeSet::new()).to_string(), "");
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            Escaped("a<b>&'c\"").to_string(),
            "a&lt;b&gt;&amp;&apos;c&quot;"
        );
    }

    #[test]
    fn renders_devices_with_addresses() {
        let mut spec = test_spec("vm0");
        spec.devices.rng = true;
        let xml = SpecConverter::new()
            .convert(&spec, &test_placement())
            .unwrap()
            .render();

        assert!(xml.starts_with("<domain type='kvm'>\n  <name>vm0</name>"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(xml.contains("<boot order='1'/>"));
        assert!(xml.contains("<mac address='52:54:00:12:34:56'/>"));
        assert!(xml.contains("<source bridge='br0'/>"));
        assert!(xml.contains("slot='0x02'"));
        assert!(xml.contains("<emulatorpin cpuset='2-5'/>"));
        assert!(xml.contains("<partition>/machine/vm0</partition>"));
        assert!(xml.contains("<rng model='virtio'>"));
        assert!(xml.contains("<os firmware='efi'>"));
        assert!(xml.ends_with("</domain>"));
    }

    #[test]
    fn changed_spec_renders_differently() {
        let converter = SpecConverter::new();
        let a = converter.convert(&test_spec("vm0"), &test_placement()).unwrap();
        let mut spec = test_spec("vm0");
        spec.memory_mib = 4096;
        let b = converter.convert(&spec, &test_placement()).unwrap();
        assert_ne!(a.render(), b.render());
        assert_eq!(a.diff(&b), vec![super::super::DefinitionChange::Memory]);
    }
}
