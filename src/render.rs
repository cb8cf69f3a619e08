//! Turns a `DomainConfig` into the `-readconfig` INI-style file QEMU reads
//! at launch.
//!
//! Two-stage design: [`build_plan`] is a pure function that walks the
//! domain config and produces an ordered [`Plan`] of [`Stanza`]s, each one
//! a `[header]` block of `key = "value"` lines. [`serialize`] then turns
//! that plan into text. Splitting it this way means the section ordering,
//! PCI slot numbering and dedup rules are all testable against the `Plan`
//! directly, without parsing text back out or spawning QEMU.

use std::{collections::HashSet, io, path::Path};

use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::{
    model::{AdapterPool, Arch, DiskDevType, DiskStatus, DomainConfig, DomainStatus, IoAdapterType, VirtualizationMode},
    sysfs,
};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no assignable adapter named {0} found")]
    AdapterNotFound(String),

    #[error("assignable adapter {adapter} is not reserved by this domain")]
    OwnershipMismatch { adapter: String },

    #[error("writing rendered config: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// A single `[header]` block with its `key = "value"` fields, in the order
/// they should be written.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub header: String,
    pub fields: Vec<(&'static str, String)>,
}

impl Stanza {
    fn new(header: impl Into<String>) -> Self {
        Self { header: header.into(), fields: Vec::new() }
    }

    fn field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    fn bool_field(self, key: &'static str, value: bool) -> Self {
        self.field(key, if value { "on" } else { "off" })
    }
}

/// An ordered sequence of stanzas that, serialized, forms a complete
/// `-readconfig` file.
#[derive(Debug, Clone, Default)]
pub struct Plan(pub Vec<Stanza>);

impl Plan {
    fn push(&mut self, stanza: Stanza) {
        self.0.push(stanza);
    }

    pub fn find(&self, header: &str) -> Option<&Stanza> {
        self.0.iter().find(|s| s.header == header)
    }

    pub fn find_all<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Stanza> {
        self.0.iter().filter(move |s| s.header.starts_with(prefix))
    }
}

pub fn serialize(plan: &Plan) -> String {
    let mut out = String::from("# This file is automatically generated by the domain manager\n");
    for stanza in &plan.0 {
        out.push('[');
        out.push_str(&stanza.header);
        out.push_str("]\n");
        for (key, value) in &stanza.fields {
            out.push_str(&format!("  {key} = \"{value}\"\n"));
        }
        out.push('\n');
    }
    out
}

pub async fn write_to(plan: &Plan, path: &Path) -> Result<()> {
    fs::write(path, serialize(plan)).await?;
    Ok(())
}

/// The root PCIe slot used by the first disk/net/passthrough device. Slots
/// 0/1/2/3 are reserved for the video device, the baseline USB controller
/// root port, virtio-serial and (implicitly) the root complex itself.
const FIRST_DYNAMIC_PCI_ID: u32 = 4;

/// Builds the complete rendering plan for a domain. `sysfs_root` is
/// consulted to classify passed-through PCI devices (bridge? Intel VGA?).
/// `state_dir` is this domain's state directory (see the module-level
/// filesystem layout docs), used to point the monitor/listener/console
/// chardevs at the right socket and pty paths.
pub async fn build_plan(
    sysfs_root: &Path,
    state_dir: &Path,
    arch: Arch,
    config: &DomainConfig,
    status: &DomainStatus,
    disks: &[DiskStatus],
    adapters: &AdapterPool,
) -> Result<Plan> {
    let mut plan = Plan::default();

    plan.push(msg_stanza());
    plan.push(machine_stanza(arch, config, status));

    if arch == Arch::Amd64 {
        plan.push(global_stanza("kvm-pit", "lost_tick_policy", "delay"));
        plan.push(global_stanza("ICH9-LPC", "disable_s3", "1"));
        plan.push(global_stanza("ICH9-LPC", "disable_s4", "1"));
        plan.push(rtc_stanza());
        plan.push(intel_iommu_stanza());
    }
    plan.push(realtime_stanza());

    plan.push(chardev_socket_stanza("charmonitor", &state_dir.join("qmp")));
    plan.push(mon_stanza("monitor", "charmonitor"));
    plan.push(chardev_socket_stanza("charlistener", &state_dir.join("listener.qmp")));
    plan.push(mon_stanza("listener", "charlistener"));

    plan.push(memory_stanza(config));
    plan.push(smp_stanza(config));

    plan.push(virtio_serial_stanza());
    plan.push(console_chardev_stanza("charserial0", &state_dir.join("cons")));
    plan.push(console_device_stanza("virtconsole0", "charserial0", "org.lfedge.console.0"));
    if config.is_oci_container {
        plan.push(console_chardev_stanza("charserial1", &state_dir.join("prime-cons")));
        plan.push(console_device_stanza("virtconsole1", "charserial1", "org.lfedge.console.prime"));
    }

    if config.enable_vnc {
        plan.push(vnc_stanza(config));
    }

    if config.gpu_config.as_deref().is_some_and(|token| !token.is_empty()) {
        plan.push(video_stanza(arch));
    }

    plan.push(baseline_root_port_stanza());
    plan.push(usb_controller_stanza());
    plan.extend_input_devices(arch);

    let mut next_pci_id = FIRST_DYNAMIC_PCI_ID;

    let (disk_stanzas, updated_pci_id) = disk_stanzas(arch, disks, next_pci_id, config.vcpus);
    plan.0.extend(disk_stanzas);
    next_pci_id = updated_pci_id;

    let (net_stanzas, updated_pci_id) = net_stanzas(config.virtualization_mode, &config.vifs, next_pci_id);
    plan.0.extend(net_stanzas);
    next_pci_id = updated_pci_id;

    let assignment = gather_adapter_assignments(config.uuid, &config.io_adapters, adapters)?;

    let (pci_stanzas, _) = pci_passthrough_stanzas(sysfs_root, &assignment.pci_bdfs, next_pci_id).await?;
    plan.0.extend(pci_stanzas);

    plan.0.extend(serial_stanzas(arch, &assignment.serials));
    plan.0.extend(usb_host_stanzas(&assignment.usb_addrs));

    Ok(plan)
}

impl Plan {
    fn extend_input_devices(&mut self, arch: Arch) {
        match arch {
            Arch::Amd64 => self.push(
                Stanza::new("device \"input0\"").field("driver", "usb-tablet").field("bus", "usb.0").field("port", "1"),
            ),
            Arch::Arm64 => {
                self.push(
                    Stanza::new("device \"input0\"").field("driver", "usb-kbd").field("bus", "usb.0").field("port", "1"),
                );
                self.push(
                    Stanza::new("device \"input1\"")
                        .field("driver", "usb-mouse")
                        .field("bus", "usb.0")
                        .field("port", "2"),
                );
            }
        }
    }
}

fn msg_stanza() -> Stanza {
    Stanza::new("msg").field("timestamp", "on")
}

fn machine_stanza(arch: Arch, config: &DomainConfig, status: &DomainStatus) -> Stanza {
    let mut stanza = Stanza::new("machine").field("type", arch.machine_type()).bool_field("dump-guest-core", false);
    if let Some(cpu_set) = &status.cpu_set {
        stanza = stanza.field("cpumask", cpu_set.clone());
    }
    if config.cpus_pinned {
        stanza = stanza.bool_field("cpu-pin", true);
    }
    stanza = match arch {
        Arch::Arm64 => stanza.field("accel", "kvm:tcg").field("gic-version", "host"),
        Arch::Amd64 => stanza.field("accel", "kvm").bool_field("vmport", false).bool_field("kernel-irqchip", true),
    };
    if let Some(bootloader) = &config.bootloader {
        stanza = stanza.field("firmware", bootloader.display().to_string());
    }
    if let Some(kernel) = &config.kernel {
        stanza = stanza.field("kernel", kernel.display().to_string());
    }
    if let Some(ramdisk) = &config.ramdisk {
        stanza = stanza.field("initrd", ramdisk.display().to_string());
    }
    if let Some(dtb) = &config.dtb {
        stanza = stanza.field("dtb", dtb.display().to_string());
    }
    if let Some(extra_args) = &config.extra_args {
        stanza = stanza.field("append", extra_args.clone());
    }
    stanza
}

fn global_stanza(driver: &'static str, property: &'static str, value: impl Into<String>) -> Stanza {
    Stanza::new("global").field("driver", driver).field("property", property).field("value", value)
}

fn rtc_stanza() -> Stanza {
    Stanza::new("rtc").field("base", "localtime").field("driftfix", "slew")
}

fn intel_iommu_stanza() -> Stanza {
    Stanza::new("device").field("driver", "intel-iommu").bool_field("caching-mode", true)
}

fn realtime_stanza() -> Stanza {
    Stanza::new("realtime").bool_field("mlock", false)
}

fn chardev_socket_stanza(id: &str, path: &Path) -> Stanza {
    Stanza::new(format!("chardev \"{id}\""))
        .field("backend", "socket")
        .field("path", path.display().to_string())
        .bool_field("server", true)
        .bool_field("wait", false)
}

fn mon_stanza(id: &'static str, chardev: &str) -> Stanza {
    Stanza::new(format!("mon \"{id}\"")).field("chardev", chardev.to_string()).field("mode", "control")
}

fn memory_stanza(config: &DomainConfig) -> Stanza {
    Stanza::new("memory").field("size", format!("{}", (config.memory_kib + 1023) / 1024))
}

fn smp_stanza(config: &DomainConfig) -> Stanza {
    Stanza::new("smp-opts")
        .field("cpus", config.vcpus.to_string())
        .field("sockets", "1")
        .field("cores", config.vcpus.to_string())
        .field("threads", "1")
}

fn virtio_serial_stanza() -> Stanza {
    Stanza::new("device \"virtio-serial0\"").field("driver", "virtio-serial").field("addr", "3")
}

fn console_chardev_stanza(id: &str, path: &Path) -> Stanza {
    Stanza::new(format!("chardev \"{id}\""))
        .field("backend", "socket")
        .bool_field("mux", true)
        .field("path", path.display().to_string())
        .bool_field("server", true)
        .bool_field("wait", false)
        .field("logfile", "/dev/fd/1")
        .bool_field("logappend", true)
}

fn console_device_stanza(id: &str, chardev: &str, name: &str) -> Stanza {
    Stanza::new(format!("device \"{id}\""))
        .field("driver", "virtconsole")
        .field("chardev", chardev.to_string())
        .field("name", name.to_string())
}

fn vnc_stanza(config: &DomainConfig) -> Stanza {
    let display = config.vnc_display.unwrap_or(0);
    let mut stanza = Stanza::new("vnc \"default\"").field("vnc", format!("0.0.0.0:{display}")).field("to", "99");
    if config.vnc_password.is_some() {
        stanza = stanza.bool_field("password", true);
    }
    stanza
}

fn video_stanza(arch: Arch) -> Stanza {
    match arch {
        Arch::Amd64 => Stanza::new("device \"video0\"")
            .field("driver", "VGA")
            .field("vgamem_mb", "16")
            .field("bus", "pcie.0")
            .field("addr", "0x1"),
        Arch::Arm64 => Stanza::new("device \"video0\"").field("driver", "virtio-gpu-pci"),
    }
}

fn baseline_root_port_stanza() -> Stanza {
    Stanza::new("device \"pci.2\"")
        .field("driver", "pcie-root-port")
        .field("port", "12")
        .field("chassis", "2")
        .field("bus", "pcie.0")
        .field("addr", "0x2")
}

fn usb_controller_stanza() -> Stanza {
    Stanza::new("device \"usb\"")
        .field("driver", "qemu-xhci")
        .field("p2", "15")
        .field("p3", "15")
        .field("bus", "pci.2")
        .field("addr", "0x0")
}

fn disk_stanzas(arch: Arch, disks: &[DiskStatus], mut next_pci_id: u32, vcpus: u32) -> (Vec<Stanza>, u32) {
    let mut stanzas = Vec::new();
    let mut disk_id = 0u32;
    let mut sata_id = 0u32;

    for disk in disks {
        match disk.device_type {
            DiskDevType::AppCustom => continue,
            DiskDevType::Cdrom => {
                let drive_id = format!("drive-sata0-{disk_id}");
                stanzas.push(
                    Stanza::new(format!("drive \"{drive_id}\""))
                        .field("file", disk.file_location.display().to_string())
                        .field("format", disk.format.to_string())
                        .field("if", "none")
                        .field("media", "cdrom")
                        .bool_field("readonly", true),
                );
                let mut device = Stanza::new(format!("device \"sata0-{sata_id}\"")).field("drive", drive_id);
                device = match arch {
                    Arch::Arm64 => device.field("driver", "usb-storage"),
                    Arch::Amd64 => device.field("driver", "ide-cd").field("bus", format!("ide.{sata_id}")),
                };
                stanzas.push(device);
                sata_id += 1;
                disk_id += 1;
            }
            DiskDevType::NineP => {
                let fsdev_id = format!("fsdev{disk_id}");
                stanzas.push(
                    Stanza::new(format!("fsdev \"{fsdev_id}\""))
                        .field("fsdriver", "local")
                        .field("security_model", "none")
                        .field("path", disk.file_location.display().to_string()),
                );
                stanzas.push(
                    Stanza::new(format!("device \"fs{disk_id}\""))
                        .field("driver", "virtio-9p-pci")
                        .field("fsdev", fsdev_id)
                        .field("mount_tag", "share_dir")
                        .field("addr", format!("{:#x}", next_pci_id)),
                );
                next_pci_id += 1;
                disk_id += 1;
            }
            DiskDevType::Legacy | DiskDevType::VirtioBlock => {
                stanzas.push(
                    Stanza::new(format!("device \"pci.{next_pci_id}\""))
                        .field("driver", "pcie-root-port")
                        .field("port", format!("1{next_pci_id}"))
                        .field("chassis", next_pci_id.to_string())
                        .field("bus", "pcie.0")
                        .field("addr", format!("{:#x}", next_pci_id)),
                );

                let drive_id = format!("drive-virtio-disk{disk_id}");
                if disk.wwn.as_deref().is_none_or(str::is_empty) {
                    let mut drive = Stanza::new(format!("drive \"{drive_id}\""))
                        .field("file", disk.file_location.display().to_string())
                        .field("format", disk.format.to_string())
                        .field("aio", disk.aio.to_string())
                        .field("cache", "writeback")
                        .field("if", "none");
                    if disk.read_only {
                        drive = drive.bool_field("readonly", true);
                    }
                    stanzas.push(drive);

                    if disk.device_type == DiskDevType::Legacy {
                        stanzas.push(
                            Stanza::new(format!("device \"ahci.{next_pci_id}\""))
                                .field("bus", format!("pci.{next_pci_id}"))
                                .field("driver", "ahci"),
                        );
                        stanzas.push(
                            Stanza::new(format!("device \"ahci-disk{disk_id}\""))
                                .field("driver", "ide-hd")
                                .field("bus", format!("ahci.{next_pci_id}.0"))
                                .field("drive", drive_id),
                        );
                    } else {
                        stanzas.push(
                            Stanza::new(format!("device \"virtio-disk{disk_id}\""))
                                .field("driver", "virtio-blk-pci")
                                .bool_field("scsi", false)
                                .field("bus", format!("pci.{next_pci_id}"))
                                .field("addr", "0x0")
                                .field("drive", drive_id),
                        );
                    }
                } else {
                    stanzas.push(
                        Stanza::new(format!("device \"vhost-disk{disk_id}\""))
                            .field("driver", "vhost-scsi-pci")
                            .field("max_sectors", "16384")
                            .field("wwpn", disk.wwn.clone().unwrap())
                            .field("bus", format!("pci.{next_pci_id}"))
                            .field("addr", "0x0")
                            .field("num_queues", vcpus.to_string()),
                    );
                }

                next_pci_id += 1;
                disk_id += 1;
            }
        }
    }

    (stanzas, next_pci_id)
}

fn net_stanzas(mode: VirtualizationMode, vifs: &[crate::model::Vif], mut next_pci_id: u32) -> (Vec<Stanza>, u32) {
    let driver = if mode == VirtualizationMode::Legacy { "e1000" } else { "virtio-net-pci" };
    let mut stanzas = Vec::new();
    for (net_id, vif) in vifs.iter().enumerate() {
        stanzas.push(
            Stanza::new(format!("device \"pci.{next_pci_id}\""))
                .field("driver", "pcie-root-port")
                .field("port", format!("1{next_pci_id}"))
                .field("chassis", next_pci_id.to_string())
                .field("bus", "pcie.0")
                .bool_field("multifunction", true)
                .field("addr", format!("{:#x}", next_pci_id)),
        );

        let netdev_id = format!("hostnet{net_id}");
        stanzas.push(
            Stanza::new(format!("netdev \"{netdev_id}\""))
                .field("type", "tap")
                .field("ifname", vif.vif_name.clone())
                .field("br", vif.bridge.clone())
                .field("downscript", "no"),
        );
        stanzas.push(
            Stanza::new(format!("device \"net{net_id}\""))
                .field("driver", driver)
                .field("netdev", netdev_id)
                .field("mac", vif.mac.clone())
                .field("bus", format!("pci.{next_pci_id}"))
                .field("addr", "0x0"),
        );
        next_pci_id += 1;
    }
    (stanzas, next_pci_id)
}

struct AdapterAssignment {
    pci_bdfs: Vec<String>,
    serials: Vec<String>,
    usb_addrs: Vec<String>,
}

/// Resolves the domain's logical `IoAdapter` references against the host's
/// adapter pool, verifying each one is actually reserved for this domain,
/// and deduplicates each target list in first-seen order.
fn gather_adapter_assignments(domain_uuid: Uuid, io_adapters: &[crate::model::IoAdapter], adapters: &AdapterPool) -> Result<AdapterAssignment> {
    let mut seen_pci = HashSet::new();
    let mut seen_usb = HashSet::new();
    let mut seen_serial = HashSet::new();
    let mut pci_bdfs = Vec::new();
    let mut serials = Vec::new();
    let mut usb_addrs = Vec::new();

    for adapter in io_adapters {
        let entries = adapters.lookup_any(&adapter.name);
        if entries.is_empty() {
            return Err(RenderError::AdapterNotFound(adapter.name.clone()));
        }
        for entry in entries {
            if entry.used_by_uuid != Some(domain_uuid) {
                return Err(RenderError::OwnershipMismatch { adapter: adapter.name.clone() });
            }
            if !entry.pci_long.is_empty() && seen_pci.insert(entry.pci_long.clone()) {
                pci_bdfs.push(entry.pci_long.clone());
            }
            if !entry.serial.is_empty() && seen_serial.insert(entry.serial.clone()) {
                serials.push(entry.serial.clone());
            }
            if !entry.usb_addr.is_empty() && seen_usb.insert(entry.usb_addr.clone()) {
                usb_addrs.push(entry.usb_addr.clone());
            }
        }
    }

    Ok(AdapterAssignment { pci_bdfs, serials, usb_addrs })
}

async fn pci_passthrough_stanzas(sysfs_root: &Path, bdfs: &[String], mut next_pci_id: u32) -> Result<(Vec<Stanza>, u32)> {
    let mut stanzas = Vec::new();
    for bdf in bdfs {
        stanzas.push(
            Stanza::new(format!("device \"pci.{next_pci_id}\""))
                .field("driver", "pcie-root-port")
                .field("port", format!("1{next_pci_id}"))
                .field("chassis", next_pci_id.to_string())
                .field("bus", "pcie.0")
                .bool_field("multifunction", true)
                .field("addr", format!("{:#x}", next_pci_id)),
        );

        let mut device = Stanza::new("device")
            .field("driver", "vfio-pci")
            .field("host", bdf.clone())
            .field("bus", format!("pci.{next_pci_id}"))
            .field("addr", "0x0");

        let (is_vga, is_intel) = classify_vga(sysfs_root, bdf).await;
        if is_vga {
            device = device.bool_field("x-vga", true);
            if is_intel {
                device = device.bool_field("x-igd-opregion", true);
            }
        }

        stanzas.push(device);
        next_pci_id += 1;
    }
    Ok((stanzas, next_pci_id))
}

/// Returns `(is_vga, is_intel_vga)`. Matches the original's split between
/// "is this a display device at all" (any vendor, drives `x-vga`) and "is
/// it specifically Intel" (drives the extra `x-igd-opregion` knob
/// Intel's IGD passthrough support needs).
async fn classify_vga(sysfs_root: &Path, bdf: &str) -> (bool, bool) {
    let is_vga = matches!(sysfs::read_class(sysfs_root, bdf).await, Ok(class) if sysfs::is_display_class(class));
    let is_intel = is_vga && matches!(sysfs::read_vendor(sysfs_root, bdf).await, Ok(vendor) if vendor == sysfs::VENDOR_INTEL);
    (is_vga, is_intel)
}

fn serial_stanzas(arch: Arch, serials: &[String]) -> Vec<Stanza> {
    let mut stanzas = Vec::new();
    for (idx, path) in serials.iter().enumerate() {
        let chardev_id = format!("charserial-usr{idx}");
        let backend = match arch {
            Arch::Arm64 => "serial",
            Arch::Amd64 => "tty",
        };
        stanzas.push(Stanza::new(format!("chardev \"{chardev_id}\"")).field("backend", backend).field("path", path.clone()));

        let driver = match arch {
            Arch::Arm64 => "pci-serial",
            Arch::Amd64 => "isa-serial",
        };
        stanzas.push(Stanza::new(format!("device \"serial-usr{idx}\"")).field("driver", driver).field("chardev", chardev_id));
    }
    stanzas
}

fn usb_host_stanzas(usb_addrs: &[String]) -> Vec<Stanza> {
    usb_addrs
        .iter()
        .map(|addr| {
            let (bus, dev) = addr.split_once(':').unwrap_or((addr.as_str(), ""));
            Stanza::new("device").field("driver", "usb-host").field("hostbus", bus.to_string()).field("hostaddr", dev.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssignableAdapter, DomainConfig, DomainStatus, MetadataType, SwState, Vif};
    use tempfile::tempdir;
    use tokio::fs;

    fn bare_config() -> DomainConfig {
        DomainConfig {
            display_name: "dom0".to_string(),
            uuid: Uuid::nil(),
            memory_kib: 2 << 20,
            vcpus: 2,
            max_cpus: 2,
            cpus_pinned: false,
            cpu_affinity: None,
            bootloader: None,
            kernel: None,
            ramdisk: None,
            dtb: None,
            extra_args: None,
            enable_vnc: false,
            vnc_display: None,
            vnc_password: None,
            gpu_config: None,
            virtualization_mode: VirtualizationMode::Normal,
            metadata_type: MetadataType::None,
            is_oci_container: false,
            vmm_max_mem_mib: 0,
            disks: Vec::new(),
            vifs: Vec::new(),
            io_adapters: Vec::new(),
        }
    }

    fn bare_status(config: &DomainConfig) -> DomainStatus {
        DomainStatus { domain_name: config.display_name.clone(), uuid: config.uuid, pid: None, state: SwState::Halted, cpu_set: None }
    }

    async fn plan_with(config: &DomainConfig, disks: &[DiskStatus], adapters: &AdapterPool) -> Plan {
        let status = bare_status(config);
        build_plan(Path::new("/nonexistent"), Path::new("/nonexistent/state"), Arch::Amd64, config, &status, disks, adapters)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn plan_starts_with_msg_and_machine_stanzas() {
        let config = bare_config();
        let plan = plan_with(&config, &[], &AdapterPool::default()).await;
        assert_eq!(plan.0[0].header, "msg");
        assert_eq!(plan.0[1].header, "machine");
        assert_eq!(plan.find("machine").unwrap().fields[0], ("type", "pc-q35-3.1".to_string()));
    }

    #[tokio::test]
    async fn memory_is_rounded_up_to_whole_mebibytes() {
        let mut config = bare_config();
        config.memory_kib = 1024 * 1024 + 1;
        let plan = plan_with(&config, &[], &AdapterPool::default()).await;
        assert_eq!(plan.find("memory").unwrap().fields[0], ("size", "1025".to_string()));
    }

    #[tokio::test]
    async fn minimal_amd64_vm_has_no_drive_sections() {
        let mut config = bare_config();
        config.memory_kib = 1 << 20;
        config.vcpus = 1;
        config.max_cpus = 1;
        let plan = plan_with(&config, &[], &AdapterPool::default()).await;
        assert_eq!(plan.find("machine").unwrap().fields.iter().find(|(k, _)| *k == "accel").unwrap().1, "kvm");
        assert_eq!(plan.find("memory").unwrap().fields[0], ("size", "1024".to_string()));
        assert!(plan.find_all("drive ").next().is_none());
    }

    #[tokio::test]
    async fn oci_container_gets_a_second_console() {
        let mut config = bare_config();
        config.is_oci_container = true;
        let plan = plan_with(&config, &[], &AdapterPool::default()).await;
        assert!(plan.find("chardev \"charserial1\"").is_some());
        assert!(plan.find("device \"virtconsole1\"").is_some());
    }

    #[tokio::test]
    async fn legacy_mode_nic_uses_e1000_driver() {
        let mut config = bare_config();
        config.virtualization_mode = VirtualizationMode::Legacy;
        config.vifs = vec![Vif { mac: "52:54:00:00:00:01".to_string(), bridge: "bridge0".to_string(), vif_name: "vif1.0".to_string() }];
        let plan = plan_with(&config, &[], &AdapterPool::default()).await;
        let net_device = plan.find("device \"net0\"").unwrap();
        assert_eq!(net_device.fields.iter().find(|(k, _)| *k == "driver").unwrap().1, "e1000");
    }

    #[tokio::test]
    async fn pci_root_port_ids_increase_strictly_and_never_reuse_base_slots() {
        let root = tempdir().unwrap();
        let sysfs_root = root.path().to_path_buf();
        for bdf in ["0000:01:00.0", "0000:02:00.0"] {
            fs::create_dir_all(sysfs_root.join("bus/pci/devices").join(bdf)).await.unwrap();
        }

        let mut config = bare_config();
        config.io_adapters =
            vec![crate::model::IoAdapter { adapter_type: IoAdapterType::Pci, name: "dev0".to_string() }, crate::model::IoAdapter {
                adapter_type: IoAdapterType::Pci,
                name: "dev1".to_string(),
            }];
        let status = bare_status(&config);
        let pool = AdapterPool::new(vec![
            AssignableAdapter {
                name: "dev0".to_string(),
                io_type: IoAdapterType::Pci,
                used_by_uuid: Some(Uuid::nil()),
                pci_long: "0000:01:00.0".to_string(),
                usb_addr: String::new(),
                serial: String::new(),
            },
            AssignableAdapter {
                name: "dev1".to_string(),
                io_type: IoAdapterType::Pci,
                used_by_uuid: Some(Uuid::nil()),
                pci_long: "0000:02:00.0".to_string(),
                usb_addr: String::new(),
                serial: String::new(),
            },
        ]);

        let plan =
            build_plan(&sysfs_root, Path::new("/nonexistent/state"), Arch::Amd64, &config, &status, &[], &pool).await.unwrap();
        let root_ports: Vec<_> = plan.find_all("device \"pci.").collect();
        // The baseline pci.2 root port precedes the two dynamically
        // assigned ones (pci.4 for dev0, pci.5 for dev1).
        assert_eq!(root_ports.len(), 3);
        assert_eq!(root_ports[0].header, "device \"pci.2\"");
        assert_eq!(root_ports[1].header, "device \"pci.4\"");
        assert_eq!(root_ports[2].header, "device \"pci.5\"");
    }

    #[tokio::test]
    async fn duplicate_bdf_across_adapters_renders_once() {
        let root = tempdir().unwrap();
        let sysfs_root = root.path().to_path_buf();
        fs::create_dir_all(sysfs_root.join("bus/pci/devices/0000:01:00.0")).await.unwrap();

        let mut config = bare_config();
        config.io_adapters =
            vec![crate::model::IoAdapter { adapter_type: IoAdapterType::Pci, name: "dev0".to_string() }, crate::model::IoAdapter {
                adapter_type: IoAdapterType::Pci,
                name: "dev0-alias".to_string(),
            }];
        let status = bare_status(&config);
        let pool = AdapterPool::new(vec![
            AssignableAdapter {
                name: "dev0".to_string(),
                io_type: IoAdapterType::Pci,
                used_by_uuid: Some(Uuid::nil()),
                pci_long: "0000:01:00.0".to_string(),
                usb_addr: String::new(),
                serial: String::new(),
            },
            AssignableAdapter {
                name: "dev0-alias".to_string(),
                io_type: IoAdapterType::Pci,
                used_by_uuid: Some(Uuid::nil()),
                pci_long: "0000:01:00.0".to_string(),
                usb_addr: String::new(),
                serial: String::new(),
            },
        ]);

        let plan =
            build_plan(&sysfs_root, Path::new("/nonexistent/state"), Arch::Amd64, &config, &status, &[], &pool).await.unwrap();
        assert_eq!(plan.0.iter().filter(|s| s.header == "device" && s.fields.iter().any(|(k, v)| *k == "driver" && v == "vfio-pci")).count(), 1);
    }

    #[tokio::test]
    async fn intel_vga_passthrough_sets_both_xvga_and_opregion() {
        let root = tempdir().unwrap();
        let sysfs_root = root.path().to_path_buf();
        let dir = sysfs_root.join("bus/pci/devices/0000:01:00.0");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("class"), "0x030000").await.unwrap();
        fs::write(dir.join("vendor"), "0x8086").await.unwrap();

        let mut config = bare_config();
        config.io_adapters = vec![crate::model::IoAdapter { adapter_type: IoAdapterType::Other, name: "gpu0".to_string() }];
        let status = bare_status(&config);
        let pool = AdapterPool::new(vec![AssignableAdapter {
            name: "gpu0".to_string(),
            io_type: IoAdapterType::Other,
            used_by_uuid: Some(Uuid::nil()),
            pci_long: "0000:01:00.0".to_string(),
            usb_addr: String::new(),
            serial: String::new(),
        }]);

        let plan =
            build_plan(&sysfs_root, Path::new("/nonexistent/state"), Arch::Amd64, &config, &status, &[], &pool).await.unwrap();
        let device = plan.0.iter().find(|s| s.fields.iter().any(|(k, v)| *k == "driver" && v == "vfio-pci")).unwrap();
        assert!(device.fields.contains(&("x-vga", "on".to_string())));
        assert!(device.fields.contains(&("x-igd-opregion", "on".to_string())));
    }

    #[tokio::test]
    async fn ownership_mismatch_rejects_the_whole_plan() {
        let mut config = bare_config();
        config.io_adapters = vec![crate::model::IoAdapter { adapter_type: IoAdapterType::Pci, name: "dev0".to_string() }];
        let status = bare_status(&config);
        let pool = AdapterPool::new(vec![AssignableAdapter {
            name: "dev0".to_string(),
            io_type: IoAdapterType::Pci,
            used_by_uuid: Some(Uuid::new_v4()),
            pci_long: "0000:01:00.0".to_string(),
            usb_addr: String::new(),
            serial: String::new(),
        }]);

        let result =
            build_plan(Path::new("/nonexistent"), Path::new("/nonexistent/state"), Arch::Amd64, &config, &status, &[], &pool)
                .await;
        assert!(matches!(result, Err(RenderError::OwnershipMismatch { .. })));
    }

    #[test]
    fn serialize_quotes_values_and_blank_line_separates_stanzas() {
        let plan = Plan(vec![Stanza::new("msg").field("timestamp", "on")]);
        let text = serialize(&plan);
        assert!(text.ends_with("[msg]\n  timestamp = \"on\"\n\n"));
    }
}
