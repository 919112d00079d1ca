//! Long-running daemon: PID lifecycle, IPC server, periodic tasks and
//! file watchers.
//!
//! State machine: `CREATED → STARTING → RUNNING → STOPPING → STOPPED`,
//! one-way only.  Reaching RUNNING requires the PID file written, the
//! IPC server accepting connections and all periodic tasks started; any
//! startup failure unwinds through STOPPING to STOPPED and unlinks the
//! PID file.  Shutdown is triggered by signal or the IPC `stop` route
//! and completes within the grace window.

pub mod ipc;
pub mod pidfile;
pub mod tasks;
pub mod watcher;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::FrameworkError;
use crate::runtime::RuntimeContext;
use pidfile::PidFile;
use tasks::{PeriodicTask, TaskScheduler, DEFAULT_GRACE};
use watcher::{FileWatcher, WatchSpec};

// ── State machine ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DaemonState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonState::Created => "CREATED",
            DaemonState::Starting => "STARTING",
            DaemonState::Running => "RUNNING",
            DaemonState::Stopping => "STOPPING",
            DaemonState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// One-way state cell; a backwards transition is a programming error and
/// is rejected.
pub struct StateCell {
    state: Mutex<DaemonState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(DaemonState::Created),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> DaemonState {
        *self.state.lock().expect("daemon state poisoned")
    }

    pub fn advance(&self, next: DaemonState) -> crate::errors::Result<()> {
        let mut state = self.state.lock().expect("daemon state poisoned");
        if next <= *state {
            return Err(FrameworkError::Internal(format!(
                "invalid daemon transition {} -> {next}",
                *state
            )));
        }
        info!(from = %*state, to = %next, "daemon state");
        *state = next;
        Ok(())
    }
}

// ── Services ────────────────────────────────────────────────

/// The capability set shared by everything the daemon hosts: periodic
/// task groups, the IPC server, watchers.
#[async_trait]
pub trait DaemonService: Send + Sync {
    fn name(&self) -> &str;
    async fn on_startup(&self) -> anyhow::Result<()>;
    async fn on_shutdown(&self);
    fn get_health(&self) -> serde_json::Value;
}

/// Process-wide `{name → service}` map backing the health endpoint.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<BTreeMap<String, Arc<dyn DaemonService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<dyn DaemonService>) {
        self.services
            .lock()
            .expect("service registry poisoned")
            .insert(service.name().to_string(), service);
    }

    pub fn health_snapshot(&self) -> serde_json::Value {
        let services = self.services.lock().expect("service registry poisoned");
        let map: serde_json::Map<String, serde_json::Value> = services
            .iter()
            .map(|(name, svc)| (name.clone(), svc.get_health()))
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn names(&self) -> Vec<String> {
        self.services
            .lock()
            .expect("service registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Health reporter for a service whose state is a simple status string.
struct StatusService {
    name: String,
    status: Mutex<serde_json::Value>,
}

impl StatusService {
    fn new(name: &str, status: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            status: Mutex::new(status),
        })
    }

    fn set(&self, status: serde_json::Value) {
        *self.status.lock().expect("service status poisoned") = status;
    }
}

#[async_trait]
impl DaemonService for StatusService {
    fn name(&self) -> &str {
        &self.name
    }
    async fn on_startup(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn on_shutdown(&self) {
        self.set(serde_json::json!({ "state": "stopped" }));
    }
    fn get_health(&self) -> serde_json::Value {
        self.status.lock().expect("service status poisoned").clone()
    }
}

// ── Daemon ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub addr: SocketAddr,
    pub grace: Duration,
    pub rpc_timeout: Duration,
}

impl DaemonOptions {
    pub fn from_config(config: &crate::config::Config) -> crate::errors::Result<Self> {
        let addr: SocketAddr = config.daemon_addr.parse().map_err(|e| {
            FrameworkError::Config(format!("bad daemon address '{}': {e}", config.daemon_addr))
        })?;
        Ok(Self {
            addr,
            grace: DEFAULT_GRACE,
            rpc_timeout: ipc::DEFAULT_RPC_TIMEOUT,
        })
    }
}

/// Run the daemon in the foreground until a signal or an IPC stop.
pub async fn run(runtime: Arc<RuntimeContext>, opts: DaemonOptions) -> anyhow::Result<()> {
    let state = StateCell::default();
    let pid_file = PidFile::new(&runtime.config.daemon_pid_path());

    if pid_file.is_running() {
        anyhow::bail!(
            "daemon already running (pid {})",
            pid_file.read().unwrap_or_default()
        );
    }

    state.advance(DaemonState::Starting)?;
    pid_file.write(std::process::id())?;

    match start_services(&runtime, &opts).await {
        Ok((server, scheduler, _watchers, stop)) => {
            state.advance(DaemonState::Running)?;
            append_log(
                &runtime.config.daemon_log_path(),
                &format!("started pid={} addr={}", std::process::id(), server.addr),
            );
            info!(addr = %server.addr, "daemon running");

            wait_for_shutdown(&stop).await;

            state.advance(DaemonState::Stopping)?;
            scheduler.shutdown().await;
            server.handle.abort();
            pid_file.remove();
            state.advance(DaemonState::Stopped)?;
            append_log(&runtime.config.daemon_log_path(), "stopped");
            info!("daemon stopped");
            Ok(())
        }
        Err(e) => {
            // Unwind the partial start.
            state.advance(DaemonState::Stopping)?;
            pid_file.remove();
            state.advance(DaemonState::Stopped)?;
            Err(e)
        }
    }
}

type StartedServices = (
    ipc::IpcServer,
    TaskScheduler,
    Vec<FileWatcher>,
    CancellationToken,
);

async fn start_services(
    runtime: &Arc<RuntimeContext>,
    opts: &DaemonOptions,
) -> anyhow::Result<StartedServices> {
    let stop = CancellationToken::new();
    let services = Arc::new(ServiceRegistry::new());

    // IPC server.
    let ipc_status = StatusService::new("ipc", serde_json::json!({ "state": "starting" }));
    services.register(ipc_status.clone());
    let mut ipc_state = ipc::IpcState::new(runtime.clone(), stop.clone());
    ipc_state.services = services.clone();
    ipc_state.rpc_timeout = opts.rpc_timeout;
    let server = ipc::start(ipc_state, opts.addr).await?;
    ipc_status.set(serde_json::json!({
        "state": "running",
        "addr": server.addr.to_string(),
    }));

    // Periodic tasks.
    let mut scheduler = TaskScheduler::new(stop.clone(), opts.grace);
    let engine = runtime.engine.clone();
    scheduler.spawn(PeriodicTask::new(
        "wal-checkpoint",
        Duration::from_secs(300),
        move || {
            engine.with_conn(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            })?;
            Ok(())
        },
    ));
    let tasks_status = StatusService::new(
        "tasks",
        serde_json::json!({ "state": "running", "count": scheduler.task_count() }),
    );
    services.register(tasks_status);

    // Manifest watcher, when a local skills directory exists.
    let mut watchers = Vec::new();
    let skills_dir = runtime.config.skills_dir.clone();
    if skills_dir.is_dir() {
        let spec = WatchSpec::new("manifests", &skills_dir, "skill.json");
        match FileWatcher::start(
            spec,
            Box::new(|paths| {
                warn!(
                    changed = paths.len(),
                    "skill manifests changed on disk; restart the daemon to reload"
                );
            }),
        ) {
            Ok(w) => {
                let status = StatusService::new(
                    "watcher:manifests",
                    serde_json::json!({ "state": "running", "path": skills_dir.display().to_string() }),
                );
                services.register(status);
                watchers.push(w);
            }
            Err(e) => warn!(error = %e, "manifest watcher failed to start"),
        }
    }

    Ok((server, scheduler, watchers, stop))
}

/// Best-effort append to the workspace daemon log.
fn append_log(path: &std::path::Path, line: &str) {
    use std::io::Write;
    let entry = format!("{} {line}\n", chrono::Utc::now().to_rfc3339());
    let res = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(entry.as_bytes()));
    if let Err(e) = res {
        warn!(path = %path.display(), error = %e, "cannot append daemon log");
    }
}

async fn wait_for_shutdown(stop: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received interrupt"),
            _ = term.recv() => info!("received terminate"),
            _ = stop.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => info!("received interrupt"),
            _ = stop.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_enforces_one_way_order() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), DaemonState::Created);
        cell.advance(DaemonState::Starting).unwrap();
        cell.advance(DaemonState::Running).unwrap();
        assert!(cell.advance(DaemonState::Starting).is_err());
        cell.advance(DaemonState::Stopped).unwrap();
        assert!(cell.advance(DaemonState::Stopping).is_err());
    }

    #[tokio::test]
    async fn service_registry_reports_health_by_name() {
        let registry = ServiceRegistry::new();
        let svc = StatusService::new("ipc", serde_json::json!({ "state": "running" }));
        registry.register(svc.clone());

        let snapshot = registry.health_snapshot();
        assert_eq!(snapshot["ipc"]["state"], "running");
        assert_eq!(registry.names(), vec!["ipc"]);

        svc.on_shutdown().await;
        assert_eq!(registry.health_snapshot()["ipc"]["state"], "stopped");
    }
}
