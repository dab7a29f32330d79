//! Owns every tunnel session: starts ssh, watches it, and tears it down.
//!
//! Sessions are keyed by local port. Each port has a slot whose async mutex
//! is held for the whole of an activate or deactivate, so operations on the
//! same port run one after another while different ports proceed in
//! parallel.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{self, CleanupQueue};
use crate::command::{self, BuildOptions, ResolvedSecrets};
use crate::error::TunnelError;
use crate::health;
use crate::process::{self, Launcher, ProcessHandle};
use crate::responder::{Ending, RecentLines, Responder};
use crate::totp;
use crate::tunnel::TunnelConfig;
use crate::yubikey::YubiKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Inactive => "inactive",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub port: u16,
    pub pid: Option<u32>,
    /// Unix seconds.
    pub started_at: u64,
}

/// Outcome of a bulk operation.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, TunnelError)>,
}

impl BatchSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded.len(), self.failed.len())
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub build: BuildOptions,
    /// Per-tunnel output logs are written here when set.
    pub log_dir: Option<PathBuf>,
    pub max_log_bytes: u64,
    pub fetch_timeout: Duration,
    /// Refuse to start when something else already listens on the local port.
    pub probe_local_port: bool,
    /// How long a reaped process gets to report its exit status.
    pub exit_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            build: BuildOptions::default(),
            log_dir: None,
            max_log_bytes: 10 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(60),
            probe_local_port: true,
            exit_grace: Duration::from_secs(2),
        }
    }
}

struct Session {
    id: u64,
    info: SessionInfo,
    handle: Box<dyn ProcessHandle>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SlotStatus {
    state: Option<SessionState>,
    info: Option<SessionInfo>,
    recent: RecentLines,
}

#[derive(Default)]
struct Slot {
    session: tokio::sync::Mutex<Option<Session>>,
    // Readable without waiting for an in-flight activate or deactivate.
    status: parking_lot::Mutex<SlotStatus>,
}

impl Slot {
    fn set_state(&self, state: SessionState) {
        self.status.lock().state = Some(state);
    }

    fn set_active(&self, info: SessionInfo, recent: RecentLines) {
        let mut status = self.status.lock();
        status.state = Some(SessionState::Active);
        status.info = Some(info);
        status.recent = recent;
    }

    fn set_inactive(&self) {
        let mut status = self.status.lock();
        status.state = Some(SessionState::Inactive);
        status.info = None;
    }
}

struct Inner {
    launcher: Arc<dyn Launcher>,
    yubikey: Arc<dyn YubiKey>,
    opts: SupervisorOptions,
    configs: parking_lot::Mutex<Vec<TunnelConfig>>,
    slots: parking_lot::Mutex<HashMap<u16, Arc<Slot>>>,
    cleanup: CleanupQueue,
    root: CancellationToken,
    next_session: AtomicU64,
}

/// Handle to the session supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        yubikey: Arc<dyn YubiKey>,
        opts: SupervisorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                yubikey,
                opts,
                configs: parking_lot::Mutex::new(Vec::new()),
                slots: parking_lot::Mutex::new(HashMap::new()),
                cleanup: CleanupQueue::new(),
                root: CancellationToken::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Register a tunnel. Its `is_active` flag is reset; only the supervisor sets it.
    pub fn add_config(&self, mut config: TunnelConfig) -> Result<(), TunnelError> {
        let mut configs = self.inner.configs.lock();
        if configs.iter().any(|c| c.name == config.name) {
            return Err(TunnelError::DuplicateName { name: config.name });
        }
        config.is_active = false;
        configs.push(config);
        Ok(())
    }

    /// Deactivate (if needed) and unregister a tunnel.
    pub async fn remove_config(&self, name: &str) -> Result<TunnelConfig, TunnelError> {
        let config = self.config(name).ok_or_else(|| TunnelError::UnknownTunnel {
            name: name.to_string(),
        })?;
        self.deactivate(&config).await;

        let mut configs = self.inner.configs.lock();
        let idx = configs
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| TunnelError::UnknownTunnel {
                name: name.to_string(),
            })?;
        Ok(configs.remove(idx))
    }

    pub fn configs(&self) -> Vec<TunnelConfig> {
        self.inner.configs.lock().clone()
    }

    pub fn config(&self, name: &str) -> Option<TunnelConfig> {
        self.inner
            .configs
            .lock()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    fn mark_active(&self, name: &str, active: bool) {
        if let Some(c) = self.inner.configs.lock().iter_mut().find(|c| c.name == name) {
            c.is_active = active;
        }
    }

    fn slot(&self, port: u16) -> Arc<Slot> {
        self.inner.slots.lock().entry(port).or_default().clone()
    }

    fn existing_slot(&self, port: u16) -> Option<Arc<Slot>> {
        self.inner.slots.lock().get(&port).cloned()
    }

    /// Start ssh for `config`. Returns once the process has been spawned.
    pub async fn activate(&self, config: &TunnelConfig) -> Result<SessionInfo, TunnelError> {
        let port = config.local_port;
        let slot = self.slot(port);
        let mut guard = slot.session.lock().await;

        if self.inner.root.is_cancelled() {
            return Err(TunnelError::ShuttingDown {
                name: config.name.clone(),
            });
        }
        if let Some(existing) = guard.as_ref() {
            return Err(TunnelError::PortInUse {
                port,
                holder: format!("tunnel '{}'", existing.info.name),
            });
        }

        slot.set_state(SessionState::Starting);
        let recent = RecentLines::default();
        match self.start(config, recent.clone()).await {
            Ok(session) => {
                let info = session.info.clone();
                *guard = Some(session);
                slot.set_active(info.clone(), recent);
                self.mark_active(&config.name, true);
                info!(
                    "started tunnel '{}' on port {} (pid {})",
                    config.name,
                    port,
                    info.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
                );
                Ok(info)
            }
            Err(e) => {
                slot.set_inactive();
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        config: &TunnelConfig,
        recent: RecentLines,
    ) -> Result<Session, TunnelError> {
        let inner = &self.inner;
        let port = config.local_port;

        let secrets = ResolvedSecrets {
            totp_code: config
                .totp_secret
                .as_deref()
                .filter(|_| config.use_totp)
                .and_then(|s| totp::current_code(s).ok()),
        };
        let plan = command::build(config, &secrets, &inner.opts.build)?;

        if config.auth_method.needs_yubikey() && !inner.yubikey.is_present().await {
            return Err(TunnelError::DeviceUnavailable {
                name: config.name.clone(),
            });
        }
        if inner.opts.probe_local_port && !health::is_port_free(port) {
            return Err(TunnelError::PortInUse {
                port,
                holder: "another process".to_string(),
            });
        }

        let launch_failed = |source| TunnelError::LaunchFailed {
            name: config.name.clone(),
            source,
        };

        // Deletion is scheduled whatever happens next.
        for file in &plan.side_files {
            inner.cleanup.schedule(file.path.clone(), file.delete_after);
        }
        for file in &plan.side_files {
            cleanup::write_side_file(file).map_err(launch_failed)?;
        }

        debug!("launching: {}", plan.display_command());
        let spawned = inner.launcher.launch(&plan).await.map_err(launch_failed)?;

        let log = match &inner.opts.log_dir {
            Some(dir) => open_log(dir, &config.name, inner.opts.max_log_bytes).await,
            None => None,
        };

        let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = inner.root.child_token();
        let responder = Responder::new(
            config.name.clone(),
            plan.rules,
            spawned.stdin,
            inner.yubikey.clone(),
            cancel.clone(),
        )
        .with_fetch_timeout(inner.opts.fetch_timeout)
        .with_recent(recent)
        .with_log(log);

        let supervisor = self.clone();
        let output = spawned.output;
        tokio::spawn(async move {
            if responder.run(output).await == Ending::EndOfStream {
                supervisor.reap(port, id).await;
            }
        });

        Ok(Session {
            id,
            info: SessionInfo {
                name: config.name.clone(),
                port,
                pid: spawned.handle.id(),
                started_at: process::unix_now(),
            },
            handle: spawned.handle,
            cancel,
        })
    }

    /// Stop the session running for `config`, if any.
    pub async fn deactivate(&self, config: &TunnelConfig) {
        let Some(slot) = self.existing_slot(config.local_port) else {
            debug!("tunnel '{}' is not active", config.name);
            return;
        };
        let mut guard = slot.session.lock().await;
        let owned = guard
            .as_ref()
            .is_some_and(|s| s.info.name == config.name);
        if !owned {
            debug!("tunnel '{}' is not active", config.name);
            return;
        }
        let Some(mut session) = guard.take() else {
            return;
        };

        slot.set_state(SessionState::Stopping);
        session.cancel.cancel();
        if !session.handle.has_exited() {
            if let Err(e) = session.handle.kill().await {
                warn!("failed to kill ssh for tunnel '{}': {}", config.name, e);
            }
        }
        slot.set_inactive();
        self.mark_active(&config.name, false);
        info!("stopped tunnel '{}'", config.name);
    }

    /// Called when ssh closed its output without being asked to.
    async fn reap(&self, port: u16, id: u64) {
        let Some(slot) = self.existing_slot(port) else {
            return;
        };
        let mut session = {
            let mut guard = slot.session.lock().await;
            if !guard.as_ref().is_some_and(|s| s.id == id) {
                return;
            }
            let Some(session) = guard.take() else {
                return;
            };
            slot.set_inactive();
            self.mark_active(&session.info.name, false);
            session
        };
        session.cancel.cancel();

        let name = session.info.name.clone();
        let last = slot.status.lock().recent.last().unwrap_or_default();
        match tokio::time::timeout(self.inner.opts.exit_grace, session.handle.wait()).await {
            Ok(Ok(Some(0))) => info!("tunnel '{}' exited", name),
            Ok(Ok(Some(code))) => warn!("tunnel '{}' exited with code {}: {}", name, code, last),
            Ok(Ok(None)) => warn!("tunnel '{}' was terminated by a signal: {}", name, last),
            Ok(Err(e)) => warn!("tunnel '{}' exit status unavailable: {}", name, e),
            Err(_) => {
                warn!("tunnel '{}' closed its output but kept running, killing it", name);
                if let Err(e) = session.handle.kill().await {
                    warn!("failed to kill ssh for tunnel '{}': {}", name, e);
                }
            }
        }
    }

    /// Activate every registered tunnel that is not already active.
    pub async fn activate_all(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for config in self.configs().into_iter().filter(|c| !c.is_active) {
            match self.activate(&config).await {
                Ok(_) => summary.succeeded.push(config.name),
                Err(e) => {
                    warn!("tunnel '{}' failed to start [{}]: {}", config.name, e.kind(), e);
                    summary.failed.push((config.name, e));
                }
            }
        }
        info!("activate all: {}", summary);
        summary
    }

    /// Deactivate every active tunnel.
    pub async fn deactivate_all(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for config in self.configs().into_iter().filter(|c| c.is_active) {
            self.deactivate(&config).await;
            summary.succeeded.push(config.name);
        }
        info!("deactivate all: {}", summary);
        summary
    }

    /// Stop every session and delete pending side files. Call before exit.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.deactivate_all().await;

        // Activations already past the shutdown check finish under their
        // slot lock; wait for each and stop what it started.
        let slots: Vec<Arc<Slot>> = self.inner.slots.lock().values().cloned().collect();
        for slot in slots {
            let name = slot.session.lock().await.as_ref().map(|s| s.info.name.clone());
            if let Some(config) = name.and_then(|n| self.config(&n)) {
                self.deactivate(&config).await;
            }
        }

        self.inner.cleanup.shutdown().await;
    }

    pub fn state(&self, port: u16) -> SessionState {
        self.existing_slot(port)
            .and_then(|slot| slot.status.lock().state)
            .unwrap_or(SessionState::Inactive)
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let slots: Vec<Arc<Slot>> = self.inner.slots.lock().values().cloned().collect();
        let mut sessions: Vec<SessionInfo> = slots
            .iter()
            .filter_map(|slot| slot.status.lock().info.clone())
            .collect();
        sessions.sort_by_key(|s| s.port);
        sessions
    }

    /// Last lines of output of the current or most recent session on `port`.
    pub fn recent_output(&self, port: u16) -> Vec<String> {
        self.existing_slot(port)
            .map(|slot| slot.status.lock().recent.snapshot())
            .unwrap_or_default()
    }
}

async fn open_log(dir: &std::path::Path, name: &str, max_bytes: u64) -> Option<tokio::fs::File> {
    let path = process::log_file(dir, name);
    process::rotate_log(&path, max_bytes);
    let opened = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    match opened {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("cannot open log {}: {}", path.display(), e);
            None
        }
    }
}
