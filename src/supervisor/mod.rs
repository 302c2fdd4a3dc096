pub mod readiness;
pub mod state_dir;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{Config, ReadinessPolicy};
use readiness::{ChildState, HttpProbe, ReadinessProbe, wait_until_ready};
use state_dir::{StateDir, generate_api_key};

const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no llamafile executable configured")]
    NoExecutable,
    #[error("failed to spawn llamafile")]
    Spawn(#[source] io::Error),
    #[error("llamafile was spawned but reported no PID")]
    MissingPid,
    #[error("llamafile process exited unexpectedly ({})", describe_status(.status))]
    ProcessExited { status: Option<ExitStatus> },
    #[error("server did not become ready within {}s", .timeout.as_secs())]
    ReadinessTimeout { timeout: Duration },
    #[error("failed to build readiness probe client")]
    ProbeClient(#[source] reqwest::Error),
    #[error("failed to access {}", .path.display())]
    StateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid PID '{content}' in {}", .path.display())]
    InvalidPidFile { path: PathBuf, content: String },
    #[error("failed to send {signal} to PID {pid}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("failed to wait for llamafile to exit")]
    Wait(#[source] io::Error),
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Foreground,
    Daemon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Running,
    NotRunning,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::NotRunning => "not running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was signalled and is gone.
    Stopped { pid: Option<u32>, forced: bool },
    /// The process had already exited before the stop request.
    AlreadyExited { pid: Option<u32> },
    /// Nothing to stop: no child and no PID file.
    NotRunning,
}

/// Where and how the inference server runs. Immutable for a supervisor's lifetime.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub executable: Option<PathBuf>,
    pub api_key: String,
    pub host: String,
    pub port: u16,
}

impl ServerHandle {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

struct Inner {
    child: Option<Child>,
    state: LifecycleState,
    run_mode: Option<RunMode>,
    interrupt_handler: bool,
}

/// Owns the llamafile process lifecycle. Clones share the same process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    handle: Arc<ServerHandle>,
    state_dir: StateDir,
    readiness: ReadinessPolicy,
    stop_grace: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl ProcessSupervisor {
    /// Builds a supervisor able to launch `executable`. The API key comes from
    /// config, then the persisted key file, then a fresh random key.
    pub fn new(cfg: &Config, executable: PathBuf) -> Self {
        Self::build(cfg, Some(executable))
    }

    /// Builds a supervisor for a server started elsewhere; it can probe and
    /// stop the daemon through the PID file but cannot launch anything.
    pub fn attach(cfg: &Config) -> Self {
        Self::build(cfg, None)
    }

    fn build(cfg: &Config, executable: Option<PathBuf>) -> Self {
        let state_dir = StateDir::new(&cfg.state_dir);
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| state_dir.read_api_key())
            .unwrap_or_else(generate_api_key);

        Self {
            handle: Arc::new(ServerHandle {
                executable,
                api_key,
                host: cfg.host.clone(),
                port: cfg.port,
            }),
            state_dir,
            readiness: cfg.readiness.clone(),
            stop_grace: cfg.stop_grace,
            inner: Arc::new(Mutex::new(Inner {
                child: None,
                state: LifecycleState::Idle,
                run_mode: None,
                interrupt_handler: false,
            })),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.handle.api_key
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// True when this instance spawned a foreground child it is responsible for.
    pub fn owns_process(&self) -> bool {
        let inner = self.lock();
        inner.run_mode == Some(RunMode::Foreground) && inner.child.is_some()
    }

    pub async fn start(&self, mode: RunMode) -> Result<(), SupervisorError> {
        let executable = self
            .handle
            .executable
            .as_deref()
            .ok_or(SupervisorError::NoExecutable)?;

        {
            let mut inner = self.lock();
            if matches!(inner.state, LifecycleState::Starting | LifecycleState::Ready) {
                warn!(state = ?inner.state, "start requested while already running");
                return Ok(());
            }
            inner.state = LifecycleState::Starting;
            inner.run_mode = Some(mode);
        }

        let result = match mode {
            RunMode::Daemon => self.start_daemon(executable).await,
            RunMode::Foreground => self.start_foreground(executable).await,
        };

        let mut inner = self.lock();
        inner.state = match &result {
            Ok(()) => LifecycleState::Ready,
            Err(_) => LifecycleState::Failed,
        };
        result
    }

    async fn start_daemon(&self, executable: &Path) -> Result<(), SupervisorError> {
        self.state_dir.ensure()?;

        let mut cmd = launch_command(executable, &self.handle.api_key);
        // Own process group, out of reach of the terminal's interrupts.
        cmd.kill_on_drop(false).process_group(0);

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::MissingPid);
        };

        // Nothing could stop a daemon without a PID file.
        if let Err(err) = self.record_daemon(pid) {
            warn!(pid, error = %err, "failed to record daemon state, killing llamafile");
            if let Err(kill_err) = child.kill().await {
                warn!(pid, error = %kill_err, "failed to kill unrecorded llamafile daemon");
            }
            self.cleanup_pid_file();
            return Err(err);
        }

        info!(
            pid,
            executable = %executable.display(),
            pid_file = %self.state_dir.pid_path().display(),
            "llamafile daemon spawned"
        );
        Ok(())
    }

    fn record_daemon(&self, pid: u32) -> Result<(), SupervisorError> {
        self.state_dir.write_pid(pid)?;
        self.state_dir.write_api_key(&self.handle.api_key)
    }

    async fn start_foreground(&self, executable: &Path) -> Result<(), SupervisorError> {
        let mut cmd = launch_command(executable, &self.handle.api_key);
        cmd.kill_on_drop(true);
        // Keep terminal interrupts away from the child; the interrupt handler stops it.
        cmd.process_group(0);

        let child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        info!(
            pid = child.id(),
            executable = %executable.display(),
            "llamafile process spawned"
        );
        self.lock().child = Some(child);
        self.install_interrupt_handler();

        debug!(
            address = %format!("{}:{}", self.handle.host, self.handle.port),
            timeout_secs = self.readiness.timeout.as_secs(),
            "waiting for llamafile to become ready"
        );
        let probe = HttpProbe::new(&self.handle.base_url(), Some(&self.handle.api_key))?;
        wait_until_ready(&probe, || self.child_state(), &self.readiness).await
    }

    fn install_interrupt_handler(&self) {
        {
            let mut inner = self.lock();
            if inner.interrupt_handler {
                return;
            }
            inner.interrupt_handler = true;
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("failed to listen for interrupt signal");
                return;
            }
            info!("interrupt received, stopping llamafile");
            if let Err(err) = supervisor.stop().await {
                eprintln!("Error stopping llamafile: {err}");
            }
            std::process::exit(130);
        });
    }

    fn child_state(&self) -> ChildState {
        let mut inner = self.lock();
        match inner.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => ChildState::Exited(Some(status)),
                Ok(None) => ChildState::Running,
                Err(err) => {
                    warn!(error = %err, "failed to poll llamafile process");
                    ChildState::Running
                }
            },
            None => ChildState::Exited(None),
        }
    }

    /// Stops the server. Uses the in-memory child when this instance spawned
    /// one, otherwise the PID file. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let (child, use_pid_file) = {
            let mut inner = self.lock();
            let child = inner.child.take();
            let use_pid_file = child.is_none()
                && inner.run_mode != Some(RunMode::Foreground)
                && inner.state != LifecycleState::Stopped;
            if child.is_some() || use_pid_file {
                inner.state = LifecycleState::Stopping;
            }
            (child, use_pid_file)
        };

        let result = match child {
            Some(child) => self.stop_child(child).await,
            None if use_pid_file => self.stop_from_pid_file().await,
            None => {
                debug!("stop requested but nothing is running");
                return Ok(StopOutcome::NotRunning);
            }
        };

        self.lock().state = LifecycleState::Stopped;
        result
    }

    async fn stop_child(&self, mut child: Child) -> Result<StopOutcome, SupervisorError> {
        let Some(pid) = child.id() else {
            debug!("llamafile process already reaped");
            return Ok(StopOutcome::AlreadyExited { pid: None });
        };
        if let Ok(Some(status)) = child.try_wait() {
            debug!(pid, status = %status, "llamafile process already exited");
            return Ok(StopOutcome::AlreadyExited { pid: Some(pid) });
        }

        debug!(pid, "stopping llamafile process");
        match send_signal(pid, Signal::SIGTERM) {
            Ok(true) => {}
            Ok(false) => return Ok(StopOutcome::AlreadyExited { pid: Some(pid) }),
            Err(err) => warn!(pid, error = %err, "graceful termination failed, killing"),
        }

        match timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, status = %status, "llamafile process stopped");
                Ok(StopOutcome::Stopped {
                    pid: Some(pid),
                    forced: false,
                })
            }
            Ok(Err(err)) => Err(SupervisorError::Wait(err)),
            Err(_) => {
                warn!(
                    pid,
                    grace_secs = self.stop_grace.as_secs(),
                    "llamafile did not terminate, forcing kill"
                );
                child.kill().await.map_err(SupervisorError::Wait)?;
                Ok(StopOutcome::Stopped {
                    pid: Some(pid),
                    forced: true,
                })
            }
        }
    }

    async fn stop_from_pid_file(&self) -> Result<StopOutcome, SupervisorError> {
        let pid = match self.state_dir.read_pid() {
            Ok(Some(pid)) => pid,
            Ok(None) => {
                debug!(
                    pid_file = %self.state_dir.pid_path().display(),
                    "no PID file, nothing to stop"
                );
                return Ok(StopOutcome::NotRunning);
            }
            Err(err) => {
                self.cleanup_pid_file();
                return Err(err);
            }
        };

        let result = terminate_pid(pid, self.stop_grace).await;
        match result {
            Ok(outcome) => {
                self.state_dir.remove_pid()?;
                Ok(outcome)
            }
            Err(err) => {
                self.cleanup_pid_file();
                Err(err)
            }
        }
    }

    fn cleanup_pid_file(&self) {
        if let Err(err) = self.state_dir.remove_pid() {
            warn!(error = %err, "failed to remove PID file");
        }
    }

    /// Stateless probe of host:port, independent of who started the server.
    pub async fn status(&self) -> ServerStatus {
        let probe = match HttpProbe::new(&self.handle.base_url(), Some(&self.handle.api_key)) {
            Ok(probe) => probe,
            Err(err) => {
                warn!(error = %err, "failed to build status probe");
                return ServerStatus::NotRunning;
            }
        };
        if probe.probe().await {
            ServerStatus::Running
        } else {
            ServerStatus::NotRunning
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `sh -c 'exec <executable> --api-key <key>'` with stdio discarded; `exec`
/// makes the shell's PID the server's PID.
fn launch_command(executable: &Path, api_key: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(launch_command_line(executable, api_key))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn launch_command_line(executable: &Path, api_key: &str) -> String {
    format!(
        "exec {} --api-key {}",
        shell_quote(&executable.to_string_lossy()),
        shell_quote(api_key)
    )
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Returns `Ok(false)` when the process no longer exists.
fn send_signal(pid: u32, signal: Signal) -> Result<bool, SupervisorError> {
    let raw = i32::try_from(pid).map_err(|_| SupervisorError::Signal {
        pid,
        signal,
        source: Errno::EINVAL,
    })?;
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(source) => Err(SupervisorError::Signal {
            pid,
            signal,
            source,
        }),
    }
}

fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

async fn terminate_pid(pid: u32, grace: Duration) -> Result<StopOutcome, SupervisorError> {
    if !send_signal(pid, Signal::SIGTERM)? {
        info!(pid, "PID from PID file is not running");
        return Ok(StopOutcome::AlreadyExited { pid: Some(pid) });
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            info!(pid, "llamafile daemon stopped");
            return Ok(StopOutcome::Stopped {
                pid: Some(pid),
                forced: false,
            });
        }
        sleep(PID_POLL_INTERVAL).await;
    }

    warn!(pid, "llamafile daemon did not terminate, forcing kill");
    send_signal(pid, Signal::SIGKILL)?;
    Ok(StopOutcome::Stopped {
        pid: Some(pid),
        forced: true,
    })
}
