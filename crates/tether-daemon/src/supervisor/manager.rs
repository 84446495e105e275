use std::{
    collections::VecDeque,
    process::Stdio,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::logging::{redact, redact_env};

use super::probe::{HttpProbe, ReadinessProbe};
use super::types::{
    Endpoint, HealthReport, ProcessState, ProcessStatus, SupervisorConfig, SupervisorError,
};
use crate::backoff;

pub type CommandBuilder = Arc<dyn Fn(&SupervisorConfig, &Endpoint) -> Command + Send + Sync>;

/// Upper bound on the delay between automatic restart attempts.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

/// How long to wait for the exit notification after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct ExitInfo {
    description: String,
}

struct ChildHandle {
    pid: u32,
    generation: u64,
    exited: watch::Receiver<Option<ExitInfo>>,
}

struct Lifecycle {
    child: Option<ChildHandle>,
    generation: u64,
    crashes: VecDeque<Instant>,
}

struct Shared {
    config: SupervisorConfig,
    builder: CommandBuilder,
    probe: Arc<dyn ReadinessProbe>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    status: watch::Sender<ProcessStatus>,
    tail: Mutex<VecDeque<String>>,
    shutdown: CancellationToken,
}

/// Owns the managed agent server process.
///
/// `start`, `stop` and `restart` serialize on one lifecycle lock. Status
/// reads (`endpoint`, `status`) go through a watch channel and never wait
/// on that lock.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let probe = Arc::new(HttpProbe::new(
            config.health_path.clone(),
            config.probe_timeout,
        ));
        Self::with_parts(config, Arc::new(default_command), probe)
    }

    pub fn with_parts(
        config: SupervisorConfig,
        builder: CommandBuilder,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let (status, _) = watch::channel(ProcessStatus::stopped(&config.host));
        Self {
            shared: Arc::new(Shared {
                config,
                builder,
                probe,
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    child: None,
                    generation: 0,
                    crashes: VecDeque::new(),
                }),
                status,
                tail: Mutex::new(VecDeque::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the process and wait until it passes the readiness probe.
    pub async fn start(&self) -> Result<Endpoint, SupervisorError> {
        let mut lc = self.shared.lifecycle.lock().await;
        self.shared.start_locked(&mut lc).await
    }

    /// Like `start`, but a failed first start enters the automatic restart
    /// path instead of leaving the process down.
    pub async fn start_or_recover(&self) -> Result<Endpoint, SupervisorError> {
        let mut lc = self.shared.lifecycle.lock().await;
        match self.shared.start_locked(&mut lc).await {
            Ok(endpoint) => Ok(endpoint),
            Err(err @ (SupervisorError::StartupFailed { .. } | SupervisorError::Spawn(_))) => {
                if self.shared.record_crash(&mut lc) {
                    self.shared.log_breaker_tripped();
                } else {
                    self.shared.spawn_restart();
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Terminate the process (SIGTERM, then SIGKILL after the grace period).
    /// The state is `Stopped` afterwards on every path.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut lc = self.shared.lifecycle.lock().await;
        self.shared.stop_locked(&mut lc).await
    }

    pub async fn restart(&self) -> Result<Endpoint, SupervisorError> {
        let mut lc = self.shared.lifecycle.lock().await;
        self.shared.stop_locked(&mut lc).await?;
        self.shared.start_locked(&mut lc).await
    }

    /// Stop for good: no further restarts, background tasks exit.
    pub async fn shutdown(&self) -> Result<(), SupervisorError> {
        self.shared.shutdown.cancel();
        self.stop().await
    }

    pub fn endpoint(&self) -> Result<Endpoint, SupervisorError> {
        let status = self.shared.status.borrow();
        status.endpoint().ok_or(SupervisorError::NotReady {
            state: status.state,
        })
    }

    pub fn status(&self) -> ProcessStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ProcessStatus> {
        self.shared.status.subscribe()
    }

    /// Most recent process output lines (redacted).
    pub fn output_tail(&self) -> Vec<String> {
        self.shared.tail_snapshot()
    }

    /// Probe the process periodically while `Ready`; kill it after too many
    /// consecutive failures so crash recovery takes over.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        let interval = self.shared.config.health_interval;
        tokio::spawn(async move {
            if interval.is_zero() {
                return;
            }
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let endpoint = shared.status.borrow().endpoint();
                let Some(endpoint) = endpoint else {
                    failures = 0;
                    continue;
                };
                let result = shared.probe_once(&endpoint).await;
                let report = HealthReport {
                    healthy: result.is_ok(),
                    checked_at: Utc::now(),
                    error: result.as_ref().err().cloned(),
                };
                shared
                    .status
                    .send_modify(|s| s.last_health = Some(report));

                match result {
                    Ok(()) => failures = 0,
                    Err(err) => {
                        failures += 1;
                        warn!(port = endpoint.port, failures, error = %err, "agent health check failed");
                        if failures >= shared.config.health_failure_threshold.max(1) {
                            let pid = shared.status.borrow().pid;
                            if let Some(pid) = pid {
                                error!(pid, failures, "agent server unhealthy, killing it");
                                if let Err(err) = send_signal(pid, StopSignal::Kill) {
                                    warn!(pid, error = %err, "failed to kill unhealthy agent server");
                                }
                            }
                            failures = 0;
                        }
                    }
                }
            }
        })
    }
}

impl Shared {
    fn set_state(&self, state: ProcessState) {
        self.status.send_modify(|s| s.state = state);
    }

    async fn probe_once(&self, endpoint: &Endpoint) -> Result<(), String> {
        match tokio::time::timeout(self.config.probe_timeout, self.probe.check(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "probe timed out after {}ms",
                self.config.probe_timeout.as_millis()
            )),
        }
    }

    async fn start_locked(
        self: &Arc<Self>,
        lc: &mut Lifecycle,
    ) -> Result<Endpoint, SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let state = self.status.borrow().state;
        if !state.accepts_start() {
            return Err(SupervisorError::AlreadyRunning { state });
        }

        let port = match self.config.port {
            0 => reserve_port(&self.config.host)?,
            port => port,
        };
        let endpoint = Endpoint {
            host: self.config.host.clone(),
            port,
        };

        lc.generation += 1;
        let generation = lc.generation;
        self.clear_tail();
        self.status.send_modify(|s| {
            s.state = ProcessState::Starting;
            s.pid = None;
            s.port = Some(port);
            s.started_at = None;
            s.last_error = None;
        });

        let mut cmd = (self.builder)(&self.config, &endpoint);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let reason = err.to_string();
                error!(command = %self.config.command, error = %reason, "failed to spawn agent server");
                self.mark_crashed(reason.clone());
                return Err(SupervisorError::Spawn(reason));
            }
        };
        let pid = child.id().unwrap_or(0);
        info!(
            pid,
            port,
            command = %self.config.command,
            env = ?redact_env(&self.config.env),
            "agent server spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            self.capture_output(stdout, "stdout", pid);
        }
        if let Some(stderr) = child.stderr.take() {
            self.capture_output(stderr, "stderr", pid);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    description: status.to_string(),
                },
                Err(err) => ExitInfo {
                    description: format!("wait failed: {err}"),
                },
            };
            let _ = exit_tx.send(Some(info.clone()));
            if let Some(shared) = weak.upgrade() {
                shared.handle_exit(generation, info).await;
            }
        });

        lc.child = Some(ChildHandle {
            pid,
            generation,
            exited: exit_rx.clone(),
        });
        self.status.send_modify(|s| s.pid = Some(pid));

        match self.wait_ready(&endpoint, exit_rx).await {
            Ok(()) => {
                self.status.send_modify(|s| {
                    s.state = ProcessState::Ready;
                    s.started_at = Some(Utc::now());
                });
                info!(pid, port, "agent server ready");
                Ok(endpoint)
            }
            Err(reason) => {
                if let Some(handle) = lc.child.take() {
                    if let Err(err) = terminate(&handle, Duration::ZERO).await {
                        warn!(pid, error = %err, "failed to kill agent server after failed start");
                    }
                }
                let output_tail = self.tail_snapshot();
                error!(pid, port, reason = %reason, "agent server failed to start");
                self.mark_crashed(reason.clone());
                Err(SupervisorError::StartupFailed {
                    reason,
                    output_tail,
                })
            }
        }
    }

    /// Poll the probe until it passes, the child exits, or the deadline passes.
    async fn wait_ready(
        &self,
        endpoint: &Endpoint,
        mut exited: watch::Receiver<Option<ExitInfo>>,
    ) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            let exit = exited.borrow().clone();
            if let Some(exit) = exit {
                return Err(format!("exited during startup ({})", exit.description));
            }

            let last_error = match self.probe_once(endpoint).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(port = endpoint.port, error = %err, "agent server not ready yet");
                    err
                }
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(format!(
                    "not ready within {}ms: {last_error}",
                    self.config.startup_timeout.as_millis()
                ));
            }
            let pause = self.config.readiness_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err("shutting down".to_string()),
                changed = exited.changed() => {
                    if changed.is_err() && exited.borrow().is_none() {
                        return Err("process watcher ended unexpectedly".to_string());
                    }
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn stop_locked(&self, lc: &mut Lifecycle) -> Result<(), SupervisorError> {
        let result = match lc.child.take() {
            Some(handle) => {
                self.set_state(ProcessState::Stopping);
                info!(pid = handle.pid, "stopping agent server");
                terminate(&handle, self.config.stop_grace).await
            }
            None => Ok(()),
        };
        lc.crashes.clear();
        self.status.send_modify(|s| {
            s.state = ProcessState::Stopped;
            s.pid = None;
            s.port = None;
            if let Err(err) = &result {
                s.last_error = Some(err.to_string());
            }
        });
        result
    }

    async fn handle_exit(self: &Arc<Self>, generation: u64, exit: ExitInfo) {
        let mut lc = self.lifecycle.lock().await;
        if lc.child.as_ref().map(|c| c.generation) != Some(generation) {
            return;
        }
        let state = self.status.borrow().state;
        if state != ProcessState::Ready {
            return;
        }
        let pid = lc.child.take().map(|c| c.pid);
        warn!(pid, exit = %exit.description, "agent server exited unexpectedly");
        self.mark_crashed(format!("exited unexpectedly ({})", exit.description));

        if self.record_crash(&mut lc) {
            self.log_breaker_tripped();
        } else if !self.shutdown.is_cancelled() {
            self.spawn_restart();
        }
    }

    fn mark_crashed(&self, reason: String) {
        self.status.send_modify(|s| {
            s.state = ProcessState::Crashed;
            s.pid = None;
            s.last_error = Some(reason);
        });
    }

    /// Count a crash; returns true when the restart budget for the window is spent.
    fn record_crash(&self, lc: &mut Lifecycle) -> bool {
        let now = Instant::now();
        lc.crashes.push_back(now);
        while let Some(oldest) = lc.crashes.front() {
            if now.duration_since(*oldest) > self.config.restart_window {
                lc.crashes.pop_front();
            } else {
                break;
            }
        }
        self.status.send_modify(|s| s.restart_count += 1);
        lc.crashes.len() > self.config.restart_max as usize
    }

    fn log_breaker_tripped(&self) {
        let restart_count = self.status.borrow().restart_count;
        error!(
            restart_count,
            restart_max = self.config.restart_max,
            window_secs = self.config.restart_window.as_secs(),
            "agent server keeps crashing; automatic restart disabled"
        );
    }

    fn spawn_restart(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(restart_loop(weak));
    }

    fn capture_output<R>(self: &Arc<Self>, reader: R, stream: &'static str, pid: u32)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = redact(&line);
                debug!(pid, stream, line = %line, "agent output");
                match weak.upgrade() {
                    Some(shared) => shared.push_tail(line),
                    None => break,
                }
            }
        });
    }

    fn push_tail(&self, line: String) {
        let limit = self.config.output_tail_lines;
        if limit == 0 {
            return;
        }
        let mut tail = lock_tail(&self.tail);
        tail.push_back(line);
        while tail.len() > limit {
            tail.pop_front();
        }
    }

    fn clear_tail(&self) {
        lock_tail(&self.tail).clear();
    }

    fn tail_snapshot(&self) -> Vec<String> {
        lock_tail(&self.tail).iter().cloned().collect()
    }
}

async fn restart_loop(weak: Weak<Shared>) {
    let mut attempt = 0u32;
    loop {
        let (delay, shutdown) = match weak.upgrade() {
            Some(shared) => (
                backoff::exponential(shared.config.restart_backoff, MAX_RESTART_DELAY, attempt),
                shared.shutdown.clone(),
            ),
            None => return,
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut lc = shared.lifecycle.lock().await;
        let state = shared.status.borrow().state;
        if state != ProcessState::Crashed {
            // Someone else started or stopped the process meanwhile.
            return;
        }
        info!(attempt = attempt + 1, "restarting agent server");
        match shared.start_locked(&mut lc).await {
            Ok(endpoint) => {
                info!(port = endpoint.port, "agent server recovered");
                return;
            }
            Err(SupervisorError::ShuttingDown) => return,
            Err(err) => {
                warn!(error = %err, "agent server restart failed");
                if shared.record_crash(&mut lc) {
                    shared.log_breaker_tripped();
                    return;
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Build the agent command: configured args with `{host}`/`{port}`
/// substituted, configured env, optional working directory.
pub fn default_command(config: &SupervisorConfig, endpoint: &Endpoint) -> Command {
    let port = endpoint.port.to_string();
    let mut cmd = Command::new(&config.command);
    cmd.args(
        config
            .args
            .iter()
            .map(|arg| arg.replace("{host}", &endpoint.host).replace("{port}", &port)),
    );
    cmd.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

fn reserve_port(host: &str) -> Result<u16, SupervisorError> {
    let listener = std::net::TcpListener::bind((host, 0))
        .map_err(|err| SupervisorError::PortReservation(err.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|err| SupervisorError::PortReservation(err.to_string()))?
        .port();
    drop(listener);
    Ok(port)
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(handle: &ChildHandle, grace: Duration) -> Result<(), SupervisorError> {
    let mut exited = handle.exited.clone();
    if exited.borrow().is_some() {
        return Ok(());
    }

    if !grace.is_zero() {
        send_signal(handle.pid, StopSignal::Term)?;
        let graceful = tokio::time::timeout(grace, exited.wait_for(Option::is_some))
            .await
            .is_ok();
        if graceful {
            return Ok(());
        }
        warn!(pid = handle.pid, grace_ms = grace.as_millis() as u64, "agent server ignored SIGTERM, killing");
    }

    send_signal(handle.pid, StopSignal::Kill)?;
    let killed = tokio::time::timeout(KILL_WAIT, exited.wait_for(Option::is_some))
        .await
        .is_ok();
    if !killed {
        warn!(pid = handle.pid, "agent server exit not observed after SIGKILL");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Term,
    Kill,
}

fn send_signal(pid: u32, signal: StopSignal) -> Result<(), SupervisorError> {
    // pid 0 would address our own process group.
    if pid == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        let raw = i32::try_from(pid).map_err(|_| SupervisorError::Signal {
            pid,
            message: "pid out of range".to_string(),
        })?;
        match kill(Pid::from_raw(raw), sig) {
            // Already gone.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(SupervisorError::Signal {
                pid,
                message: err.to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        Err(SupervisorError::Signal {
            pid,
            message: "signals are only supported on unix".to_string(),
        })
    }
}

fn lock_tail(tail: &Mutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    match tail.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
