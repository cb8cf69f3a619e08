//! Publishes per-process resource metrics for watchdog-monitored processes,
//! and defines the sink trait the lifecycle manager uses to report domain
//! state changes. Process enumeration mirrors the original agent's
//! `processes.go`: watched pids come from one file per pid under a
//! watchdog directory, each file's contents naming a second file under the
//! run directory that actually holds the pid.

use std::{collections::HashSet, path::{Path, PathBuf}};

use async_trait::async_trait;
use metrics::gauge;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::model::{DomainStatus, ProcessMetric};

/// Where domain status changes and process metrics end up. A real
/// implementation would forward these into the host's publish/subscribe
/// store; tests substitute a recording sink.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, status: &DomainStatus);
    async fn unpublish(&self, uuid: uuid::Uuid);
    async fn publish_process_metric(&self, metric: &ProcessMetric);
    async fn unpublish_process_metric(&self, pid: u32);
}

/// A `MetricsSink` that only emits `metrics` crate counters/gauges, for
/// hosts that don't need a separate publish/subscribe store.
#[derive(Default)]
pub struct CounterOnlySink;

#[async_trait]
impl MetricsSink for CounterOnlySink {
    async fn publish(&self, status: &DomainStatus) {
        gauge!("domain_state", "domain" => status.domain_name.clone()).set(state_code(status.state) as f64);
    }

    async fn unpublish(&self, uuid: uuid::Uuid) {
        debug!(%uuid, "domain removed from metrics");
    }

    async fn publish_process_metric(&self, metric: &ProcessMetric) {
        gauge!("process_cpu_percent", "pid" => metric.pid.to_string()).set(metric.cpu_percent as f64);
        gauge!("process_rss_bytes", "pid" => metric.pid.to_string()).set(metric.rss_bytes as f64);
    }

    async fn unpublish_process_metric(&self, pid: u32) {
        debug!(pid, "process removed from metrics");
    }
}

fn state_code(state: crate::model::SwState) -> u8 {
    use crate::model::SwState::*;
    match state {
        Halted => 0,
        Paused => 1,
        Pausing => 2,
        Running => 3,
        Halting => 4,
        Broken => 5,
    }
}

/// Periodically gathers process metrics for every pid the watchdog is
/// monitoring and forwards them to a `MetricsSink`, unpublishing pids that
/// have since disappeared.
pub struct ProcessMetricsPublisher {
    watchdog_pid_dir: PathBuf,
    watchdog_run_dir: PathBuf,
    system: System,
    known_pids: HashSet<u32>,
}

impl ProcessMetricsPublisher {
    pub fn new(watchdog_pid_dir: impl Into<PathBuf>, watchdog_run_dir: impl Into<PathBuf>) -> Self {
        Self {
            watchdog_pid_dir: watchdog_pid_dir.into(),
            watchdog_run_dir: watchdog_run_dir.into(),
            system: System::new(),
            known_pids: HashSet::new(),
        }
    }

    /// One collection cycle: enumerates every process on the host,
    /// publishes a metric for each user-space process (tagging the ones
    /// the watchdog is also tracking as `watched`), and unpublishes any
    /// previously-published pid that has since exited or stopped being a
    /// user process.
    pub async fn tick(&mut self, sink: &dyn MetricsSink) {
        let watched = match Self::watched_pids(&self.watchdog_pid_dir, &self.watchdog_run_dir).await {
            Ok(pids) => pids,
            Err(err) => {
                warn!("reading watchdog pid directory: {err}");
                return;
            }
        };

        self.system.refresh_memory();
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        let total_memory = self.system.total_memory();

        let mut seen = HashSet::new();
        for (pid, process) in self.system.processes() {
            if process.exe().is_none() {
                continue;
            }
            let pid = pid.as_u32();
            let metric = Self::to_process_metric(pid, process, watched.contains(&pid), total_memory).await;
            seen.insert(pid);
            sink.publish_process_metric(&metric).await;
        }

        for &pid in self.known_pids.difference(&seen) {
            sink.unpublish_process_metric(pid).await;
        }
        self.known_pids = seen;
    }

    async fn to_process_metric(
        pid: u32,
        process: &sysinfo::Process,
        watched: bool,
        total_memory_bytes: u64,
    ) -> ProcessMetric {
        let (user_time_secs, system_time_secs) = Self::cpu_times(pid).await;
        let memory_percent =
            if total_memory_bytes > 0 { process.memory() as f32 / total_memory_bytes as f32 * 100.0 } else { 0.0 };
        ProcessMetric {
            pid,
            name: process.name().to_string_lossy().into_owned(),
            user_process: process.exe().is_some(),
            watched,
            cpu_percent: process.cpu_usage(),
            memory_percent,
            num_fds: Self::num_open_fds(pid).await,
            num_threads: process.tasks().map(|t| t.len() as u64).unwrap_or(0),
            user_time_secs,
            system_time_secs,
            create_time_unix_secs: process.start_time() as i64,
            vm_bytes: process.virtual_memory(),
            rss_bytes: process.memory(),
        }
    }

    /// Reads user/system CPU time straight from `/proc/<pid>/stat` (fields
    /// 14 and 15, in clock ticks): sysinfo only gives a combined
    /// `cpu_usage`, not the user/system split. Falls back to zero if the
    /// pid is gone or the host isn't Linux, same as `num_open_fds` above.
    async fn cpu_times(pid: u32) -> (f64, f64) {
        const CLK_TCK: f64 = 100.0;
        let contents = match tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await {
            Ok(contents) => contents,
            Err(_) => return (0.0, 0.0),
        };
        // The comm field can itself contain spaces or parens, so split on
        // the last ')' rather than just whitespace.
        let Some((_, after_comm)) = contents.rsplit_once(')') else {
            return (0.0, 0.0);
        };
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime = fields.get(11).and_then(|f| f.parse::<f64>().ok()).unwrap_or(0.0);
        let stime = fields.get(12).and_then(|f| f.parse::<f64>().ok()).unwrap_or(0.0);
        (utime / CLK_TCK, stime / CLK_TCK)
    }

    /// Counts entries under `/proc/<pid>/fd`. Falls back to -1 when the
    /// directory can't be read (permission denied, pid gone, or a non-Linux
    /// host where sysinfo also can't give us this), matching the "FD count
    /// unavailable" sentinel the original agent uses.
    async fn num_open_fds(pid: u32) -> i32 {
        let mut entries = match tokio::fs::read_dir(format!("/proc/{pid}/fd")).await {
            Ok(entries) => entries,
            Err(_) => return -1,
        };
        let mut count = 0i32;
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
        count
    }

    async fn watched_pids(watchdog_pid_dir: &Path, watchdog_run_dir: &Path) -> std::io::Result<HashSet<u32>> {
        let mut pids = HashSet::new();
        let mut entries = match tokio::fs::read_dir(watchdog_pid_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(pids),
            Err(err) => return Err(err),
        };

        while let Some(entry) = entries.next_entry().await? {
            let pid_file = watchdog_run_dir.join(entry.file_name());
            let contents = match tokio::fs::read_to_string(&pid_file).await {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("reading pid file {}: {err}", pid_file.display());
                    continue;
                }
            };
            match contents.trim().parse::<u32>() {
                Ok(pid) => {
                    pids.insert(pid);
                }
                Err(err) => warn!("pid file {} contained '{}': {err}", pid_file.display(), contents.trim()),
            }
        }
        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::fs;

    #[derive(Default)]
    struct RecordingSink {
        published: StdMutex<Vec<u32>>,
        unpublished: StdMutex<Vec<u32>>,
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn publish(&self, _status: &DomainStatus) {}
        async fn unpublish(&self, _uuid: uuid::Uuid) {}
        async fn publish_process_metric(&self, metric: &ProcessMetric) {
            self.published.lock().unwrap().push(metric.pid);
        }
        async fn unpublish_process_metric(&self, pid: u32) {
            self.unpublished.lock().unwrap().push(pid);
        }
    }

    #[tokio::test]
    async fn watched_pids_reads_pid_file_contents_not_filenames() {
        let root = tempdir().unwrap();
        let pid_dir = root.path().join("watchdog/pid");
        let run_dir = root.path().join("run");
        fs::create_dir_all(&pid_dir).await.unwrap();
        fs::create_dir_all(&run_dir).await.unwrap();
        fs::write(pid_dir.join("myservice"), "").await.unwrap();
        fs::write(run_dir.join("myservice"), format!("{}\n", std::process::id())).await.unwrap();

        let pids = ProcessMetricsPublisher::watched_pids(&pid_dir, &run_dir).await.unwrap();
        assert!(pids.contains(&std::process::id()));
    }

    #[tokio::test]
    async fn missing_watchdog_dir_yields_no_pids_not_an_error() {
        let pids = ProcessMetricsPublisher::watched_pids(Path::new("/nonexistent"), Path::new("/nonexistent")).await.unwrap();
        assert!(pids.is_empty());
    }

    #[tokio::test]
    async fn tick_unpublishes_pids_that_stop_being_watched() {
        let root = tempdir().unwrap();
        let pid_dir = root.path().join("watchdog/pid");
        let run_dir = root.path().join("run");
        fs::create_dir_all(&pid_dir).await.unwrap();
        fs::create_dir_all(&run_dir).await.unwrap();

        let mut publisher = ProcessMetricsPublisher::new(&pid_dir, &run_dir);
        publisher.known_pids.insert(999_999);

        let sink = RecordingSink::default();
        publisher.tick(&sink).await;

        assert_eq!(sink.unpublished.lock().unwrap().as_slice(), &[999_999]);
    }
}
