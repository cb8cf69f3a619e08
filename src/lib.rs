pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod overhead;
pub mod pci;
pub mod qmp;
pub mod render;
mod sysfs;

use tracing_subscriber::EnvFilter;

/// Installs a env-filter-driven tracing subscriber. The embedding process
/// is expected to call this once, before constructing a `LifecycleManager`.
pub fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
}
