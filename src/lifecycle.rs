//! Domain lifecycle: the actor that owns a single QEMU process end to end,
//! and the manager that routes `Setup`/`Start`/`Stop`/`Delete`/`Cleanup`/
//! `Info` calls to the right actor. Each domain gets its own task talking
//! to its own `QmpClient`, so a wedged domain can't block progress on any
//! other; callers interact only through channel-backed handles.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::{
    process::Command,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::{
    config::{DeviceModelProfile, OperatorConfig},
    metrics::MetricsSink,
    model::{AdapterPool, Arch, DomainConfig, DomainStatus, GlobalConfig, SwState, VirtualizationMode},
    overhead::OverheadEstimator,
    pci::PciBinder,
    qmp::{self, QmpClient},
    render,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("domain {0} already exists")]
    AlreadyExists(Uuid),

    #[error("domain {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Render(#[from] render::RenderError),

    #[error(transparent)]
    Overhead(#[from] crate::overhead::OverheadError),

    #[error(transparent)]
    Pci(#[from] crate::pci::PciError),

    #[error(transparent)]
    Qmp(#[from] qmp::QmpError),

    #[error("spawning qemu-system: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("domain worker task is gone")]
    WorkerGone,
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// The operations a domain manager exposes. Kept as a trait so callers can
/// mock it out without standing up real QEMU processes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    async fn setup(&self, config: DomainConfig, adapters: &AdapterPool, global: &GlobalConfig) -> Result<DomainStatus>;
    async fn start(&self, uuid: Uuid) -> Result<()>;
    async fn stop(&self, uuid: Uuid, force: bool) -> Result<()>;
    async fn delete(&self, uuid: Uuid) -> Result<()>;
    async fn cleanup(&self, uuid: Uuid) -> Result<()>;
    async fn info(&self, uuid: Uuid) -> Result<DomainStatus>;
}

enum WorkerCommand {
    Start(oneshot::Sender<Result<()>>),
    Stop(bool, oneshot::Sender<Result<()>>),
    Delete(oneshot::Sender<Result<()>>),
    Cleanup(oneshot::Sender<Result<()>>),
    Info(oneshot::Sender<Result<DomainStatus>>),
}

struct DomainHandle {
    sender: mpsc::Sender<WorkerCommand>,
    join_handle: JoinHandle<()>,
    cancellation: CancellationToken,
}

/// Orchestrates a fleet of per-domain actors.
pub struct LifecycleManager {
    operator: OperatorConfig,
    arch: Arch,
    binder: Arc<PciBinder>,
    estimator: Arc<OverheadEstimator>,
    metrics: Arc<dyn MetricsSink>,
    domains: Mutex<HashMap<Uuid, DomainHandle>>,
}

impl LifecycleManager {
    pub fn new(operator: OperatorConfig, arch: Arch, metrics: Arc<dyn MetricsSink>) -> Self {
        let binder = Arc::new(PciBinder::new(operator.sysfs_root.clone()));
        let estimator = Arc::new(OverheadEstimator::new(operator.sysfs_root.clone()));
        Self { operator, arch, binder, estimator, metrics, domains: Mutex::new(HashMap::new()) }
    }

    fn domain_dir(&self, uuid: Uuid) -> PathBuf {
        self.operator.state_root.join(uuid.to_string())
    }

    async fn call<T>(&self, uuid: Uuid, build: impl FnOnce(oneshot::Sender<Result<T>>) -> WorkerCommand) -> Result<T> {
        let sender = {
            let domains = self.domains.lock().await;
            domains.get(&uuid).ok_or(LifecycleError::NotFound(uuid))?.sender.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        sender.send(build(reply_tx)).await.map_err(|_| LifecycleError::WorkerGone)?;
        reply_rx.await.map_err(|_| LifecycleError::WorkerGone)?
    }
}

#[async_trait]
impl TaskRuntime for LifecycleManager {
    #[instrument(skip(self, config, adapters, global), fields(domain = %config.display_name, uuid = %config.uuid))]
    async fn setup(&self, config: DomainConfig, adapters: &AdapterPool, global: &GlobalConfig) -> Result<DomainStatus> {
        let uuid = config.uuid;
        {
            let domains = self.domains.lock().await;
            if domains.contains_key(&uuid) {
                return Err(LifecycleError::AlreadyExists(uuid));
            }
        }

        let overhead = self
            .estimator
            .estimate(
                &config.display_name,
                uuid,
                config.memory_kib * 1024,
                config.vmm_max_mem_mib,
                config.max_cpus,
                config.vcpus,
                &config.io_adapters,
                adapters,
                Some(global),
            )
            .await?;
        info!("domain {} estimated VMM overhead: {overhead} bytes", config.display_name);

        for adapter in &config.io_adapters {
            for entry in adapters.lookup_any(&adapter.name) {
                if !entry.pci_long.is_empty() {
                    self.binder.reserve(&entry.pci_long).await?;
                }
            }
        }

        let domain_dir = self.domain_dir(uuid);
        tokio::fs::create_dir_all(&domain_dir).await.map_err(LifecycleError::Spawn)?;

        let mut status = DomainStatus {
            domain_name: config.display_name.clone(),
            uuid,
            pid: None,
            state: SwState::Halted,
            cpu_set: config.cpu_affinity.clone(),
        };

        let plan =
            render::build_plan(&self.operator.sysfs_root, &domain_dir, self.arch, &config, &status, &config.disks, adapters)
                .await?;
        render::write_to(&plan, &domain_dir.join("domain.cfg")).await?;

        let cancellation = CancellationToken::new();
        let worker = DomainWorker {
            config,
            status: status.clone(),
            arch: self.arch,
            operator: self.operator.clone(),
            metrics: self.metrics.clone(),
            child: None,
            event_listener: None,
            cancellation: cancellation.clone(),
        };

        let (sender, receiver) = mpsc::channel(16);
        let span = tracing::info_span!("domain", uuid = %uuid);
        let join_handle = tokio::spawn(worker.run(receiver).instrument(span));

        self.domains.lock().await.insert(uuid, DomainHandle { sender, join_handle, cancellation });
        status.state = SwState::Halted;
        Ok(status)
    }

    async fn start(&self, uuid: Uuid) -> Result<()> {
        self.call(uuid, WorkerCommand::Start).await
    }

    async fn stop(&self, uuid: Uuid, force: bool) -> Result<()> {
        self.call(uuid, |reply| WorkerCommand::Stop(force, reply)).await
    }

    async fn delete(&self, uuid: Uuid) -> Result<()> {
        let result = self.call(uuid, WorkerCommand::Delete).await;
        if let Some(handle) = self.domains.lock().await.remove(&uuid) {
            handle.cancellation.cancel();
            let _ = handle.join_handle.await;
        }
        result
    }

    async fn cleanup(&self, uuid: Uuid) -> Result<()> {
        self.call(uuid, WorkerCommand::Cleanup).await
    }

    async fn info(&self, uuid: Uuid) -> Result<DomainStatus> {
        self.call(uuid, WorkerCommand::Info).await
    }
}

/// Per-domain actor. Owns the one QEMU child process for its whole
/// lifetime and serializes every state transition through its own command
/// queue, so `Start`/`Stop`/`Info` against the same domain never race.
struct DomainWorker {
    config: DomainConfig,
    status: DomainStatus,
    arch: Arch,
    operator: OperatorConfig,
    metrics: Arc<dyn MetricsSink>,
    child: Option<tokio::process::Child>,
    event_listener: Option<JoinHandle<()>>,
    cancellation: CancellationToken,
}

impl DomainWorker {
    fn domain_dir(&self) -> PathBuf {
        self.operator.state_root.join(self.config.uuid.to_string())
    }

    fn qmp_sock(&self) -> PathBuf {
        self.domain_dir().join("qmp")
    }

    fn listener_sock(&self) -> PathBuf {
        self.domain_dir().join("listener.qmp")
    }

    fn config_path(&self) -> PathBuf {
        self.domain_dir().join("domain.cfg")
    }

    async fn run(mut self, mut receiver: mpsc::Receiver<WorkerCommand>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                command = receiver.recv() => {
                    let Some(command) = command else { return };
                    match command {
                        WorkerCommand::Start(reply) => {
                            let result = self.do_start().await;
                            let _ = reply.send(result);
                        }
                        WorkerCommand::Stop(force, reply) => {
                            let result = self.do_stop(force).await;
                            let _ = reply.send(result);
                        }
                        WorkerCommand::Delete(reply) => {
                            let result = self.do_delete().await;
                            let _ = reply.send(result);
                            return;
                        }
                        WorkerCommand::Cleanup(reply) => {
                            let result = self.do_cleanup().await;
                            let _ = reply.send(result);
                        }
                        WorkerCommand::Info(reply) => {
                            let result = self.do_info().await;
                            let _ = reply.send(result);
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.poll_state().await;
                }
                _ = self.cancellation.cancelled() => {
                    info!("domain worker cancelled");
                    return;
                }
            }
        }
    }

    async fn do_start(&mut self) -> Result<()> {
        if self.status.state == SwState::Running {
            return Ok(());
        }

        let profile = DeviceModelProfile::for_arch(self.arch);
        let cpu_args = match self.config.virtualization_mode {
            VirtualizationMode::Fml => profile.fml_cpu_args,
            _ => profile.cpu_args,
        };

        let mut command = Command::new(&self.operator.qemu_system_bin);
        for arg in profile.dm_args_iter() {
            command.arg(arg);
        }
        command.arg("-cpu").arg(cpu_args.join(","));
        if self.config.metadata_type == crate::model::MetadataType::OpenStack {
            command.arg("-smbios").arg("type=1,product=OpenStack Compute");
        }
        command
            .arg("-name")
            .arg(&self.config.display_name)
            .arg("-uuid")
            .arg(self.config.uuid.to_string())
            .arg("-readconfig")
            .arg(self.config_path())
            .arg("-pidfile")
            .arg(self.domain_dir().join("pid"));

        let child = command.spawn().map_err(LifecycleError::Spawn)?;
        self.status.pid = child.id();
        self.child = Some(child);
        self.status.state = SwState::Pausing;

        qmp::wait_for_qmp(&self.qmp_sock(), true, &self.cancellation).await?;

        self.event_listener = Some(qmp::spawn_event_listener(
            self.listener_sock(),
            self.config.display_name.clone(),
            self.cancellation.clone(),
        ));

        let client = QmpClient::new(self.qmp_sock());
        if let Some(password) = self.config.vnc_password.as_deref() {
            client.set_vnc_password(password).await?;
        }
        client.resume().await?;

        let status = client.query_status().await?;
        if !matches!(status.status, qapi::qmp::RunState::running) {
            self.status.state = SwState::Broken;
            return Err(LifecycleError::Qmp(qmp::QmpError::NotRunningAfterCont {
                domain: self.config.display_name.clone(),
                status: format!("{:?}", status.status),
            }));
        }

        self.status.state = SwState::Running;
        self.metrics.publish(&self.status).await;
        counter!("domain_starts_total", "domain" => self.config.display_name.clone()).increment(1);
        info!("domain {} started (pid {:?})", self.config.display_name, self.status.pid);
        Ok(())
    }

    /// Issues the shutdown/quit request and returns. Does not wait for the
    /// child to actually exit: `poll_state`/`Cleanup` observe the real
    /// outcome once QEMU has had a chance to act on it.
    async fn do_stop(&mut self, force: bool) -> Result<()> {
        if self.status.state != SwState::Running && self.status.state != SwState::Paused {
            return Ok(());
        }
        self.status.state = SwState::Halting;

        let client = QmpClient::new(self.qmp_sock());
        if force {
            client.quit().await?;
        } else {
            client.shutdown().await?;
        }

        self.metrics.publish(&self.status).await;
        counter!("domain_stops_total", "domain" => self.config.display_name.clone()).increment(1);
        info!("domain {} stop requested", self.config.display_name);
        Ok(())
    }

    /// Delete is unconditional: pause then quit the VM best-effort (a
    /// domain that's already wedged shouldn't block its own deletion), then
    /// tear down the state directory regardless of whether QMP cooperated.
    async fn do_delete(&mut self) -> Result<()> {
        if self.status.state == SwState::Running || self.status.state == SwState::Paused {
            let client = QmpClient::new(self.qmp_sock());
            if let Err(err) = client.pause().await {
                warn!("pausing domain {} before delete: {err}", self.config.display_name);
            }
            if let Err(err) = client.quit().await {
                warn!("quitting domain {} during delete: {err}", self.config.display_name);
            }
        }
        if let Some(handle) = self.event_listener.take() {
            handle.abort();
        }
        // Releasing reserved PCI devices back from vfio-pci needs the
        // adapter pool, which this crate treats as externally owned (see
        // the Open Question decision on keeping `AdapterPool` read-only).
        // Callers are expected to release each `pci_long` their own pool
        // has on record for this uuid via `PciBinder::release` once delete
        // returns.
        if let Err(err) = tokio::fs::remove_dir_all(self.domain_dir()).await {
            warn!("removing domain directory {}: {err}", self.domain_dir().display());
        }
        self.status.state = SwState::Halted;
        self.status.pid = None;
        self.metrics.unpublish(self.config.uuid).await;
        info!("domain {} deleted", self.config.display_name);
        Ok(())
    }

    async fn do_cleanup(&mut self) -> Result<()> {
        if self.status.state == SwState::Running {
            return Ok(());
        }
        if let Some(child) = self.child.take() {
            drop(child);
        }
        qmp::wait_for_qmp(&self.qmp_sock(), false, &self.cancellation).await?;
        if let Some(handle) = self.event_listener.take() {
            handle.abort();
        }
        let _ = tokio::fs::remove_file(self.qmp_sock()).await;
        self.status.state = SwState::Halted;
        self.status.pid = None;
        Ok(())
    }

    async fn do_info(&mut self) -> Result<DomainStatus> {
        self.poll_state().await;
        Ok(self.status.clone())
    }

    /// Reconciles our view of the domain with QMP's, in case the guest
    /// shut itself down or paused without us noticing.
    async fn poll_state(&mut self) {
        if self.status.state != SwState::Running && self.status.state != SwState::Paused {
            return;
        }
        let client = QmpClient::new(self.qmp_sock());
        match client.query_status().await {
            Ok(info) => {
                self.status.state = map_run_state(&info.status);
                self.metrics.publish(&self.status).await;
            }
            Err(_) => {
                self.status.state = SwState::Broken;
                self.metrics.publish(&self.status).await;
            }
        }
    }
}

fn map_run_state(status: &qapi::qmp::RunState) -> SwState {
    use qapi::qmp::RunState::*;
    match status {
        running => SwState::Running,
        paused | suspended | colo | preconfig | finish_migrate | postmigrate | prelaunch | restore_vm | save_vm => {
            SwState::Paused
        }
        inmigrate | watchdog => SwState::Pausing,
        shutdown => SwState::Halting,
        _ => SwState::Broken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetadataType;

    #[derive(Default)]
    struct NullSink;

    #[async_trait]
    impl MetricsSink for NullSink {
        async fn publish(&self, _status: &DomainStatus) {}
        async fn unpublish(&self, _uuid: Uuid) {}
        async fn publish_process_metric(&self, _metric: &crate::model::ProcessMetric) {}
        async fn unpublish_process_metric(&self, _pid: u32) {}
    }

    fn bare_config(uuid: Uuid) -> DomainConfig {
        DomainConfig {
            display_name: "dom0".to_string(),
            uuid,
            memory_kib: 2 << 20,
            vcpus: 1,
            max_cpus: 1,
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
            vmm_max_mem_mib: 128,
            disks: Vec::new(),
            vifs: Vec::new(),
            io_adapters: Vec::new(),
        }
    }

    #[tokio::test]
    async fn setup_rejects_a_uuid_that_already_exists() {
        let root = tempfile::tempdir().unwrap();
        let operator = OperatorConfig::scratch(root.path());
        let manager = LifecycleManager::new(operator, Arch::Amd64, Arc::new(NullSink));
        let uuid = Uuid::new_v4();

        let pool = AdapterPool::default();
        let global = GlobalConfig::new(std::collections::HashMap::from([("VmmMemoryLimitInMiB".to_string(), 0)]));
        manager.setup(bare_config(uuid), &pool, &global).await.unwrap();
        let result = manager.setup(bare_config(uuid), &pool, &global).await;
        assert!(matches!(result, Err(LifecycleError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn operations_against_an_unknown_domain_fail_with_not_found() {
        let root = tempfile::tempdir().unwrap();
        let operator = OperatorConfig::scratch(root.path());
        let manager = LifecycleManager::new(operator, Arch::Amd64, Arc::new(NullSink));
        let result = manager.info(Uuid::new_v4()).await;
        assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    }
}
