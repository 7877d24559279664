//! Backend lifecycle supervision
//!
//! Backends are started one at a time, in a caller-given order, because
//! several may compete for the same devices. Each is launched (when the
//! supervisor manages its process), then polled on a fixed interval until it
//! answers ready or its startup wait runs out. A backend that never becomes
//! ready is marked `Down` and the sequence moves on, so a partial fleet still
//! serves.
//!
//! Shutdown sends a stop signal to every tracked process, waits out a grace
//! period, then force-terminates whatever is left. It can be called any
//! number of times.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use switchyard_common::config::SupervisorConfig;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_common::METRICS;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::descriptor::{BackendDescriptor, DescriptorStore};
use crate::health::{BackendProbe, HealthTracker};

/// A running backend process
#[async_trait]
pub trait BackendProcess: Send + Sync {
    /// Ask the process to exit
    async fn terminate(&mut self) -> Result<()>;

    /// Force the process to exit
    async fn kill(&mut self) -> Result<()>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<()>;

    /// Exit status, if the process has already exited
    fn try_wait(&mut self) -> Result<Option<String>>;
}

/// Starts backend processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, backend: &BackendDescriptor) -> Result<Box<dyn BackendProcess>>;
}

/// Launches backends as child processes pinned to their device group
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

struct ChildProcess {
    backend_id: String,
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, backend: &BackendDescriptor) -> Result<Box<dyn BackendProcess>> {
        let launch = backend
            .launch
            .as_ref()
            .ok_or_else(|| SwitchyardError::process(format!("{} has no launch command", backend.id)))?;

        tokio::fs::create_dir_all(&launch.log_dir).await?;
        let log_path = launch.log_dir.join(format!("{}.log", backend.id));
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?
            .into_std()
            .await;

        let devices = backend
            .devices
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut command = tokio::process::Command::new(&launch.program);
        command
            .args(&launch.args)
            .env("CUDA_VISIBLE_DEVICES", &devices)
            .env("HIP_VISIBLE_DEVICES", &devices)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .kill_on_drop(true);
        for var in &launch.env {
            command.env(&var.name, &var.value);
        }

        let child = command.spawn().map_err(|e| {
            SwitchyardError::process(format!("failed to launch {} ({}): {}", backend.id, launch.program, e))
        })?;
        info!(
            "Launched {} (pid {:?}) on devices [{}], logging to {}",
            backend.id,
            child.id(),
            devices,
            log_path.display()
        );

        Ok(Box::new(ChildProcess {
            backend_id: backend.id.clone(),
            child,
        }))
    }
}

#[async_trait]
impl BackendProcess for ChildProcess {
    async fn terminate(&mut self) -> Result<()> {
        // No pid means the child was already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
            SwitchyardError::process(format!("failed to stop {} (pid {}): {}", self.backend_id, pid, e))
        })
    }

    async fn kill(&mut self) -> Result<()> {
        if self.child.id().is_none() {
            return Ok(());
        }
        self.child
            .start_kill()
            .map_err(|e| SwitchyardError::process(format!("failed to kill {}: {}", self.backend_id, e)))
    }

    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        debug!("{} exited with {}", self.backend_id, status);
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<String>> {
        Ok(self.child.try_wait()?.map(|status| status.to_string()))
    }
}

struct ManagedProcess {
    backend_id: String,
    process: Box<dyn BackendProcess>,
}

/// Result of a startup sequence
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub ready: Vec<String>,
    /// Backend id and reason
    pub failed: Vec<(String, String)>,
}

/// Result of a shutdown
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Exited within the grace period
    pub stopped: Vec<String>,
    /// Had to be force-terminated
    pub forced: Vec<String>,
}

impl ShutdownReport {
    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && self.forced.is_empty()
    }
}

/// Starts, watches and stops the fleet
pub struct LifecycleSupervisor {
    store: Arc<DescriptorStore>,
    health: Arc<HealthTracker>,
    probe: Arc<dyn BackendProbe>,
    launcher: Arc<dyn ProcessLauncher>,
    config: SupervisorConfig,
    probe_timeout: Duration,

    processes: Mutex<Vec<ManagedProcess>>,
    shut_down: AtomicBool,
}

impl LifecycleSupervisor {
    pub fn new(
        store: Arc<DescriptorStore>,
        health: Arc<HealthTracker>,
        probe: Arc<dyn BackendProbe>,
        launcher: Arc<dyn ProcessLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        let probe_timeout = health.config().probe_timeout();
        Self {
            store,
            health,
            probe,
            launcher,
            config,
            probe_timeout,
            processes: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Start backends in `order`, one after the other
    pub async fn startup(&self, order: &[String]) -> StartupReport {
        let mut report = StartupReport::default();

        for id in order {
            if self.is_shut_down() {
                info!("Shutdown requested, abandoning startup sequence");
                break;
            }
            let Some(backend) = self.store.get(id).cloned() else {
                warn!("Startup order names unknown backend {}", id);
                report.failed.push((id.clone(), "unknown backend".to_string()));
                continue;
            };

            match self.start_backend(&backend).await {
                Ok(()) => report.ready.push(backend.id.clone()),
                Err(e) => {
                    error!("Backend {} failed to start: {}", backend.id, e);
                    self.health.mark_down(&backend.id, &e.to_string()).await;
                    report.failed.push((backend.id.clone(), e.to_string()));
                }
            }
        }

        info!(
            "Startup finished: {} ready, {} failed",
            report.ready.len(),
            report.failed.len()
        );
        report
    }

    async fn start_backend(&self, backend: &BackendDescriptor) -> Result<()> {
        self.health.mark_starting(&backend.id).await;

        if backend.is_managed() {
            let process = self.launcher.launch(backend).await.map_err(|e| {
                METRICS.fleet.startups.with_label_values(&["launch_failed"]).inc();
                e
            })?;
            let mut managed = ManagedProcess {
                backend_id: backend.id.clone(),
                process,
            };
            let mut processes = self.processes.lock().await;
            if self.is_shut_down() {
                // Shutdown already collected the process list
                drop(processes);
                self.stop_process(&mut managed).await;
                return Err(SwitchyardError::process("shutdown during startup"));
            }
            processes.push(managed);
        } else {
            debug!("{} is not managed here, waiting for it to come up", backend.id);
        }

        let timeout = backend.startup_timeout.unwrap_or_else(|| self.config.startup_timeout());
        match self.wait_ready(backend, timeout).await {
            Ok(()) => {
                self.health.mark_ready(&backend.id).await;
                METRICS.fleet.startups.with_label_values(&["ready"]).inc();
                info!("Backend {} is ready", backend.id);
                Ok(())
            }
            Err(e) => {
                let outcome = match &e {
                    SwitchyardError::Timeout(_) => "timed_out",
                    _ => "exited",
                };
                METRICS.fleet.startups.with_label_values(&[outcome]).inc();
                self.stop_one(&backend.id).await;
                Err(e)
            }
        }
    }

    /// Poll the backend every `poll_interval` until ready or `timeout` passes
    async fn wait_ready(&self, backend: &BackendDescriptor, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let deadline = started + timeout;
        let poll = self.config.poll_interval();

        loop {
            match tokio::time::timeout(self.probe_timeout, self.probe.probe(backend)).await {
                Ok(Ok(response)) if response.ready => return Ok(()),
                Ok(Ok(_)) => debug!("{} is up but not ready yet", backend.id),
                Ok(Err(e)) => debug!("{} not answering yet: {}", backend.id, e),
                Err(_) => debug!("{} probe timed out", backend.id),
            }

            if let Some(status) = self.exit_status(&backend.id).await {
                return Err(SwitchyardError::process(format!(
                    "{} exited during startup ({})",
                    backend.id, status
                )));
            }
            if self.is_shut_down() {
                return Err(SwitchyardError::process("shutdown during startup"));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SwitchyardError::timeout(format!(
                    "{} not ready after {:?}",
                    backend.id,
                    now - started
                )));
            }
            tokio::time::sleep_until((now + poll).min(deadline)).await;
        }
    }

    async fn exit_status(&self, backend_id: &str) -> Option<String> {
        let mut processes = self.processes.lock().await;
        let managed = processes.iter_mut().find(|p| p.backend_id == backend_id)?;
        managed.process.try_wait().ok().flatten()
    }

    /// Stop one backend's process, if we launched it
    async fn stop_one(&self, backend_id: &str) {
        let managed = {
            let mut processes = self.processes.lock().await;
            let index = processes.iter().position(|p| p.backend_id == backend_id);
            index.map(|i| processes.remove(i))
        };
        if let Some(mut managed) = managed {
            let forced = self.stop_process(&mut managed).await;
            debug!("Stopped {} (forced: {})", backend_id, forced);
        }
    }

    /// Stop and reap a process; returns whether it had to be forced
    async fn stop_process(&self, managed: &mut ManagedProcess) -> bool {
        if let Err(e) = managed.process.terminate().await {
            warn!("{}", e);
        }
        self.reap_or_kill(managed, Instant::now() + self.config.shutdown_grace())
            .await
    }

    async fn reap_or_kill(&self, managed: &mut ManagedProcess, deadline: Instant) -> bool {
        if tokio::time::timeout_at(deadline, managed.process.wait()).await.is_ok() {
            return false;
        }

        warn!("{} did not exit in time, killing it", managed.backend_id);
        METRICS.fleet.forced_terminations.inc();
        if let Err(e) = managed.process.kill().await {
            warn!("{}", e);
        }
        if tokio::time::timeout(self.config.shutdown_grace(), managed.process.wait())
            .await
            .is_err()
        {
            error!("{} survived a forced kill", managed.backend_id);
        }
        true
    }

    /// Mark backends whose process exited on its own as `Down`
    pub async fn reap_exited(&self) -> Vec<String> {
        if self.is_shut_down() {
            return Vec::new();
        }

        let exited: Vec<(String, String)> = {
            let mut processes = self.processes.lock().await;
            let mut exited = Vec::new();
            let mut index = 0;
            while index < processes.len() {
                match processes[index].process.try_wait() {
                    Ok(Some(status)) => {
                        let managed = processes.remove(index);
                        exited.push((managed.backend_id, status));
                    }
                    Ok(None) => index += 1,
                    Err(e) => {
                        warn!("Could not check {}: {}", processes[index].backend_id, e);
                        index += 1;
                    }
                }
            }
            exited
        };

        for (backend_id, status) in &exited {
            error!("Backend {} exited unexpectedly ({})", backend_id, status);
            self.health
                .mark_down(backend_id, &format!("process exited ({})", status))
                .await;
        }
        exited.into_iter().map(|(id, _)| id).collect()
    }

    /// Watch for processes that exit on their own
    pub fn start_exit_watch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.reap_exited().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stop every tracked process. Later calls find nothing left to stop.
    pub async fn shutdown(&self) -> ShutdownReport {
        // Held throughout so concurrent callers queue behind the first
        let mut processes = self.processes.lock().await;
        let first = !self.shut_down.swap(true, Ordering::AcqRel);
        let mut report = ShutdownReport::default();

        let mut managed = std::mem::take(&mut *processes);
        if !first && managed.is_empty() {
            debug!("Shutdown already completed");
            return report;
        }
        info!("Stopping {} backend processes", managed.len());

        for entry in managed.iter_mut() {
            if let Err(e) = entry.process.terminate().await {
                warn!("{}", e);
            }
        }

        let deadline = Instant::now() + self.config.shutdown_grace();
        for mut entry in managed {
            if self.reap_or_kill(&mut entry, deadline).await {
                report.forced.push(entry.backend_id);
            } else {
                report.stopped.push(entry.backend_id);
            }
        }

        if first {
            for backend in self.store.all() {
                self.health.mark_down(&backend.id, "fleet shutdown").await;
            }
        }

        info!(
            "Shutdown complete: {} stopped, {} forced",
            report.stopped.len(),
            report.forced.len()
        );
        report
    }
}
