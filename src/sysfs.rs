//! Low-level sysfs PCI helpers shared by the passthrough binder, overhead
//! estimator and config renderer. Kept in one place so the three callers
//! agree on class-code and resource-line parsing.

use std::path::{Path, PathBuf};

use tokio::fs;

/// Base PCI class for bridge devices (host/PCI, PCI/PCI, ...).
const CLASS_BRIDGE: u32 = 0x06;
/// Base PCI class for display controllers (VGA and friends).
const CLASS_DISPLAY: u32 = 0x03;
/// Intel's PCI vendor ID, used to decide whether `x-igd-opregion` applies.
pub const VENDOR_INTEL: u32 = 0x8086;

pub fn device_dir(sysfs_root: &Path, bdf: &str) -> PathBuf {
    sysfs_root.join("bus/pci/devices").join(bdf)
}

/// A single line of a PCI device's sysfs `resource` file.
#[derive(Debug, Clone, Copy)]
pub struct PciResource {
    pub start: u64,
    pub end: u64,
    pub flags: u64,
}

impl PciResource {
    /// A resource line is unset when both start and end are zero.
    pub fn is_valid(&self) -> bool {
        self.start != 0 && self.end != 0 && self.end >= self.start
    }

    /// Bit 0 of the flags word marks an I/O port range rather than memory.
    pub fn is_memory(&self) -> bool {
        self.flags & 0x1 == 0
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

fn parse_hex(field: &str) -> Option<u64> {
    u64::from_str_radix(field.trim_start_matches("0x"), 16).ok()
}

pub async fn read_resources(sysfs_root: &Path, bdf: &str) -> std::io::Result<Vec<PciResource>> {
    let path = device_dir(sysfs_root, bdf).join("resource");
    let contents = fs::read_to_string(&path).await?;
    let mut resources = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (Some(start), Some(end), Some(flags)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let (Some(start), Some(end), Some(flags)) = (parse_hex(start), parse_hex(end), parse_hex(flags)) {
            resources.push(PciResource { start, end, flags });
        }
    }
    Ok(resources)
}

async fn read_hex_attr(sysfs_root: &Path, bdf: &str, attr: &str) -> std::io::Result<u32> {
    let path = device_dir(sysfs_root, bdf).join(attr);
    let contents = fs::read_to_string(&path).await?;
    parse_hex(contents.trim())
        .map(|v| v as u32)
        .ok_or_else(|| std::io::Error::other(format!("malformed {attr} for {bdf}")))
}

pub async fn read_class(sysfs_root: &Path, bdf: &str) -> std::io::Result<u32> {
    read_hex_attr(sysfs_root, bdf, "class").await
}

pub async fn read_vendor(sysfs_root: &Path, bdf: &str) -> std::io::Result<u32> {
    read_hex_attr(sysfs_root, bdf, "vendor").await
}

/// The class file packs base class / subclass / programming interface into
/// three bytes; only the top byte (base class) matters for our checks.
pub fn base_class(class: u32) -> u32 {
    class >> 16
}

pub fn is_bridge_class(class: u32) -> bool {
    base_class(class) == CLASS_BRIDGE
}

pub fn is_display_class(class: u32) -> bool {
    base_class(class) == CLASS_DISPLAY
}

pub async fn read_iommu_group(sysfs_root: &Path, bdf: &str) -> std::io::Result<String> {
    let link = device_dir(sysfs_root, bdf).join("iommu_group");
    let target = fs::read_link(&link).await?;
    target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| std::io::Error::other(format!("malformed iommu_group link for {bdf}")))
}
