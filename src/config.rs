//! Operator-supplied configuration: where state lives, which binaries to
//! invoke, and the per-arch device-model argv fragments needed to launch
//! QEMU. Deserialized the same way the agent's own `AgentConfig` is.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::model::Arch;

#[derive(Deserialize, Debug, Clone)]
pub struct OperatorConfig {
    /// Root directory under which per-domain state (qmp sockets, rendered
    /// config files, disk images) is kept.
    pub state_root: PathBuf,

    /// Path to the `qemu-system-*` binary to launch.
    pub qemu_system_bin: PathBuf,

    /// Path to `qemu-img`, used for disk provisioning.
    pub qemu_img_bin: PathBuf,

    /// Root of the sysfs tree. Overridable so tests can point it at a
    /// scratch directory instead of the real `/sys`.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Directory containing one file per watchdog-monitored pid.
    #[serde(default = "default_watchdog_pid_dir")]
    pub watchdog_pid_dir: PathBuf,

    /// Directory holding the actual pid files the watchdog directory's
    /// entries point at.
    #[serde(default = "default_run_dir")]
    pub watchdog_run_dir: PathBuf,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_watchdog_pid_dir() -> PathBuf {
    PathBuf::from("/run/watchdog/pid")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/run")
}

impl OperatorConfig {
    /// Loads the operator config from a JSON file on disk. The embedding
    /// process is expected to call this once at startup.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading operator config at {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parsing operator config at {}", path.display()))
    }

    /// Convenience constructor for tests: everything rooted under a single
    /// scratch directory, binaries left as bare names.
    #[cfg(test)]
    pub fn scratch(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            state_root: root.join("state"),
            qemu_system_bin: PathBuf::from("qemu-system-x86_64"),
            qemu_img_bin: PathBuf::from("qemu-img"),
            sysfs_root: root.join("sys"),
            watchdog_pid_dir: root.join("run/watchdog/pid"),
            watchdog_run_dir: root.join("run"),
        }
    }
}

/// Static argv fragment passed to every domain regardless of architecture:
/// no graphical display of our own, start halted until `cont` is issued,
/// skip the user's `~/.qemu` config, don't synthesize any default devices
/// (the readconfig file is the whole PCIe topology), don't let the guest's
/// own shutdown request kill the process out from under us, and wire the
/// primary console to the chardev the renderer already set up.
const COMMON_DM_ARGS: &[&str] =
    &["-display", "none", "-S", "-no-user-config", "-nodefaults", "-no-shutdown", "-serial", "chardev:charserial0"];

/// amd64-only: the HPET is a emulation tax this topology doesn't need.
const AMD64_DM_ARGS: &[&str] = &["-no-hpet"];

/// The device-model argv fragments the renderer and lifecycle manager need
/// per architecture: which binary to exec, the static flags every launch
/// needs, and the CPU flag sets for the normal and "fml" virtualization
/// modes.
#[derive(Debug, Clone)]
pub struct DeviceModelProfile {
    pub binary: &'static str,
    pub machine_type: &'static str,
    pub dm_args: &'static [&'static str],
    pub cpu_args: &'static [&'static str],
    pub fml_cpu_args: &'static [&'static str],
}

impl DeviceModelProfile {
    pub fn for_arch(arch: Arch) -> Self {
        match arch {
            Arch::Amd64 => DeviceModelProfile {
                binary: arch.qemu_system_binary(),
                machine_type: arch.machine_type(),
                dm_args: AMD64_DM_ARGS,
                cpu_args: &["host,migratable=no,+invtsc"],
                fml_cpu_args: &["host,migratable=no,+invtsc,hv_relaxed,hv_vapic,hv_spinlocks=0x1fff"],
            },
            Arch::Arm64 => DeviceModelProfile {
                binary: arch.qemu_system_binary(),
                machine_type: arch.machine_type(),
                dm_args: &[],
                cpu_args: &["host"],
                fml_cpu_args: &["host"],
            },
        }
    }

    /// The complete static argv fragment for this architecture: the common
    /// flags every launch needs, followed by any arch-specific ones.
    pub fn dm_args_iter(&self) -> impl Iterator<Item = &'static str> {
        COMMON_DM_ARGS.iter().copied().chain(self.dm_args.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Arch::Amd64, "qemu-system-x86_64", "pc-q35-3.1")]
    #[case(Arch::Arm64, "qemu-system-aarch64", "virt")]
    fn device_model_profile_matches_arch(#[case] arch: Arch, #[case] binary: &str, #[case] machine_type: &str) {
        let profile = DeviceModelProfile::for_arch(arch);
        assert_eq!(profile.binary, binary);
        assert_eq!(profile.machine_type, machine_type);
    }

    #[test]
    fn load_rejects_a_missing_file() {
        let result = OperatorConfig::load(Path::new("/nonexistent/operator.json"));
        assert!(result.is_err());
    }
}
