//! Binds and releases PCI devices to/from `vfio-pci` for passthrough.
//!
//! Mirrors the sysfs dance the original agent performs: set
//! `driver_override`, unbind the current driver if any, then nudge
//! `drivers_probe` so the kernel rebinds it to `vfio-pci` (or, on release,
//! back to whatever driver claims it by default).

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info};

use crate::sysfs;

pub const VFIO_PCI_DRIVER: &str = "vfio-pci";

#[derive(Debug, Error)]
pub enum PciError {
    #[error("reading iommu group for {bdf}: {source}")]
    IommuGroup { bdf: String, #[source] source: io::Error },

    /// Sysfs was left in a state we can't reason about: a write that should
    /// be infallible on a healthy kernel failed partway through the
    /// sequence. Callers should treat the device, and likely the whole
    /// domain, as unusable rather than retry.
    #[error("sysfs write '{operation}' failed for {bdf}: {source}")]
    Fatal { operation: &'static str, bdf: String, #[source] source: io::Error },
}

pub type Result<T> = std::result::Result<T, PciError>;

/// Binds or releases PCI devices for passthrough. Holds a process-wide lock
/// so that two devices sharing an IOMMU group are never reserved or
/// released concurrently: interleaved `driver_override`/`unbind` writes on
/// siblings can otherwise race the kernel's own rebind.
pub struct PciBinder {
    sysfs_root: PathBuf,
    lock: Mutex<()>,
}

impl PciBinder {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self { sysfs_root: sysfs_root.into(), lock: Mutex::new(()) }
    }

    fn device_dir(&self, bdf: &str) -> PathBuf {
        sysfs::device_dir(&self.sysfs_root, bdf)
    }

    /// Reserve `bdf` for VFIO passthrough. Idempotent: already being bound
    /// to `vfio-pci` is success, not an error.
    pub async fn reserve(&self, bdf: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        if self.bound_to(bdf, VFIO_PCI_DRIVER).await {
            debug!("{bdf} already bound to {VFIO_PCI_DRIVER}");
            return Ok(());
        }

        let device_dir = self.device_dir(bdf);
        self.write_fatal("driver_override", bdf, &device_dir.join("driver_override"), VFIO_PCI_DRIVER.as_bytes())
            .await?;
        self.unbind_current_driver(bdf).await?;
        self.write_fatal(
            "drivers_probe",
            bdf,
            &self.sysfs_root.join("bus/pci/drivers_probe"),
            bdf.as_bytes(),
        )
        .await?;

        info!("reserved {bdf} for passthrough");
        Ok(())
    }

    /// Release `bdf` back to whatever driver the kernel would normally bind
    /// by default, by clearing the override and re-probing.
    pub async fn release(&self, bdf: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let device_dir = self.device_dir(bdf);
        self.write_fatal("driver_override", bdf, &device_dir.join("driver_override"), b"\n").await?;
        self.unbind_current_driver(bdf).await?;
        self.write_fatal(
            "drivers_probe",
            bdf,
            &self.sysfs_root.join("bus/pci/drivers_probe"),
            bdf.as_bytes(),
        )
        .await?;

        info!("released {bdf} from passthrough");
        Ok(())
    }

    /// True if two devices sit behind the same IOMMU group, or, failing
    /// that (no IOMMU on the host), the same PCI function's parent device.
    pub async fn same_controller(&self, bdf1: &str, bdf2: &str) -> bool {
        match (sysfs::read_iommu_group(&self.sysfs_root, bdf1).await, sysfs::read_iommu_group(&self.sysfs_root, bdf2).await)
        {
            (Ok(g1), Ok(g2)) => g1 == g2,
            _ => Self::same_domain_bus_device(bdf1, bdf2),
        }
    }

    fn same_domain_bus_device(bdf1: &str, bdf2: &str) -> bool {
        let prefix = |bdf: &str| bdf.rsplit_once('.').map(|(head, _)| head.to_string());
        matches!((prefix(bdf1), prefix(bdf2)), (Some(a), Some(b)) if a == b)
    }

    async fn bound_to(&self, bdf: &str, driver: &str) -> bool {
        let driver_link = self.device_dir(bdf).join("driver");
        let candidate = self.sysfs_root.join("bus/pci/drivers").join(driver);
        let (Ok(a), Ok(b)) = (fs::canonicalize(&driver_link).await, fs::canonicalize(&candidate).await) else {
            return false;
        };
        a == b
    }

    async fn unbind_current_driver(&self, bdf: &str) -> Result<()> {
        let unbind = self.device_dir(bdf).join("driver/unbind");
        if fs::try_exists(&unbind).await.unwrap_or(false) {
            self.write_fatal("unbind", bdf, &unbind, bdf.as_bytes()).await?;
        }
        Ok(())
    }

    async fn write_fatal(&self, operation: &'static str, bdf: &str, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).await.map_err(|source| PciError::Fatal { operation, bdf: bdf.to_string(), source })
    }
}
