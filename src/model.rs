//! The shared data model: everything the renderer, the lifecycle manager and
//! the overhead estimator pass between each other. Kept dependency-free of
//! the other component modules so it can be imported everywhere.

use std::{collections::HashMap, path::PathBuf};

use uuid::Uuid;

/// Host CPU architecture. Drives machine type, device-model binary and CPU
/// feature flags the same way `runtime.GOARCH` does in the original agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn machine_type(&self) -> &'static str {
        match self {
            Arch::Amd64 => "pc-q35-3.1",
            Arch::Arm64 => "virt",
        }
    }

    pub fn qemu_system_binary(&self) -> &'static str {
        match self {
            Arch::Amd64 => "qemu-system-x86_64",
            Arch::Arm64 => "qemu-system-aarch64",
        }
    }
}

/// How heavily the hypervisor virtualizes the guest. Chosen per-domain and
/// affects which CPU flags and PCIe topology get emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VirtualizationMode {
    #[default]
    Normal,
    Fml,
    Legacy,
    NoHyper,
}

/// Cloud-init style metadata exposed to the guest, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataType {
    #[default]
    None,
    OpenStack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Qcow2,
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
        };
        write!(f, "{s}")
    }
}

/// What kind of virtual block device a disk should be attached as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskDevType {
    Cdrom,
    NineP,
    Legacy,
    #[default]
    VirtioBlock,
    /// Application-custom data forwarded to the guest out of band (as a
    /// download URL); never rendered as a QEMU device.
    AppCustom,
}

/// The AIO backend QEMU uses to service a disk's I/O. `io_uring` is the
/// default on hosts new enough to support it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AioType(pub String);

impl Default for AioType {
    fn default() -> Self {
        AioType("io_uring".to_string())
    }
}

impl std::fmt::Display for AioType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DiskStatus {
    pub device_type: DiskDevType,
    pub file_location: PathBuf,
    pub format: ImageFormat,
    pub read_only: bool,
    pub wwn: Option<String>,
    pub aio: AioType,
}

#[derive(Debug, Clone)]
pub struct Vif {
    pub mac: String,
    pub bridge: String,
    pub vif_name: String,
}

/// Tag for the kind of device an `IoAdapter` reference resolves to in the
/// assignable-adapter pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAdapterType {
    Other,
    Hdmi,
    Serial,
    Usb,
    Pci,
}

#[derive(Debug, Clone)]
pub struct IoAdapter {
    pub adapter_type: IoAdapterType,
    pub name: String,
}

/// One entry in the host's pool of assignable devices. Populated out of
/// band (by device discovery) and looked up, never mutated, by this crate.
#[derive(Debug, Clone)]
pub struct AssignableAdapter {
    pub name: String,
    pub io_type: IoAdapterType,
    pub used_by_uuid: Option<Uuid>,
    pub pci_long: String,
    pub usb_addr: String,
    pub serial: String,
}

/// Read-only view over the host's assignable adapters, keyed by logical
/// name. A name may resolve to more than one physical entry (a "bundle"),
/// mirroring `LookupIoBundleAny`.
#[derive(Debug, Clone, Default)]
pub struct AdapterPool {
    entries: Vec<AssignableAdapter>,
}

impl AdapterPool {
    pub fn new(entries: Vec<AssignableAdapter>) -> Self {
        Self { entries }
    }

    pub fn lookup_any(&self, name: &str) -> Vec<&AssignableAdapter> {
        self.entries.iter().filter(|a| a.name == name).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub display_name: String,
    pub uuid: Uuid,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub max_cpus: u32,
    pub cpus_pinned: bool,
    pub cpu_affinity: Option<String>,
    pub bootloader: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub ramdisk: Option<PathBuf>,
    pub dtb: Option<PathBuf>,
    pub extra_args: Option<String>,
    pub enable_vnc: bool,
    pub vnc_display: Option<u32>,
    pub vnc_password: Option<String>,
    /// Opaque GPU configuration token. Non-empty enables a video device in
    /// the rendered config (`VGA` on amd64, `virtio-gpu-pci` on arm64).
    pub gpu_config: Option<String>,
    pub virtualization_mode: VirtualizationMode,
    pub metadata_type: MetadataType,
    /// Whether this domain's task is an OCI container, which gets a second
    /// "prime" console in addition to the primary one.
    pub is_oci_container: bool,
    pub vmm_max_mem_mib: u32,
    pub disks: Vec<DiskStatus>,
    pub vifs: Vec<Vif>,
    pub io_adapters: Vec<IoAdapter>,
}

/// The runtime state machine a domain moves through. Names match the
/// original agent's `SwState` one for one so log lines stay recognizable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwState {
    Halted,
    Paused,
    Pausing,
    Running,
    Halting,
    Broken,
}

impl std::fmt::Display for SwState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SwState::Halted => "HALTED",
            SwState::Paused => "PAUSED",
            SwState::Pausing => "PAUSING",
            SwState::Running => "RUNNING",
            SwState::Halting => "HALTING",
            SwState::Broken => "BROKEN",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct DomainStatus {
    pub domain_name: String,
    pub uuid: Uuid,
    pub pid: Option<u32>,
    pub state: SwState,
    /// The CPU set Setup pinned the domain to, if any. Distinct from
    /// `DomainConfig::cpu_affinity`: this is what actually got applied.
    pub cpu_set: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProcessMetric {
    pub pid: u32,
    pub name: String,
    pub user_process: bool,
    pub watched: bool,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub num_fds: i32,
    pub num_threads: u64,
    pub user_time_secs: f64,
    pub system_time_secs: f64,
    pub create_time_unix_secs: i64,
    pub vm_bytes: u64,
    pub rss_bytes: u64,
}

/// Read-only global tunables keyed by name, the same shape as the original
/// agent's global config item store. Only the keys this crate reads are
/// typed; callers may still pass through an arbitrary map.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    items: HashMap<String, i64>,
}

impl GlobalConfig {
    pub fn new(items: HashMap<String, i64>) -> Self {
        Self { items }
    }

    /// `VmmMemoryLimitInMiB`: an operator override for total VMM overhead,
    /// in MiB. Zero or absent means "no override".
    pub fn vmm_memory_limit_mib(&self) -> Option<i64> {
        self.items.get("VmmMemoryLimitInMiB").copied()
    }
}
