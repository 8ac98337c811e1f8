//! # Supervisor for one proxy-core subprocess.
//!
//! ```text
//!            start                       stop
//! Stopped ───────────► Running ───────────────────► Stopped
//!                        │  ▲
//!                restart │  │ stop + launch
//!                        ▼  │
//!                     Restarting   (concurrent restart = no-op)
//! ```
//!
//! - Config is validated before any process mutation.
//! - The child reads its config from stdin, which is closed after writing.
//! - `stop` sends SIGTERM to the child's process group, waits up to
//!   `terminate_timeout`, then SIGKILLs the group.
//! - Hooks run on their own tasks; their errors are logged and dropped.
//!
//! `start`, `stop` and `restart` are not serialized against each other
//! except for the restart guard. Callers issuing them concurrently on the
//! same supervisor must serialize externally.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{LogBroadcaster, Subscriber};
use crate::config::{CoreKind, SupervisorSettings};
use crate::error::AgentError;
use crate::launcher::CoreLauncher;
use crate::transform::{ConfigDocument, TransformContext};

pub type CoreHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Stopped,
    Running,
    Restarting,
}

struct RunningCore {
    child: Child,
    pid: Option<u32>,
    _reader: JoinHandle<()>,
}

pub struct CoreSupervisor {
    kind: CoreKind,
    launcher: CoreLauncher,
    transform: TransformContext,
    settings: SupervisorSettings,
    version: Option<String>,
    logs: Arc<LogBroadcaster>,
    process: Mutex<Option<RunningCore>>,
    restarting: AtomicBool,
    on_start: Mutex<Vec<CoreHook>>,
    on_stop: Mutex<Vec<CoreHook>>,
}

impl CoreSupervisor {
    /// Builds a stopped supervisor and caches the executable's version.
    pub async fn new(
        launcher: CoreLauncher,
        transform: TransformContext,
        settings: SupervisorSettings,
    ) -> Self {
        let version = launcher.probe_version().await;
        Self {
            kind: transform.kind,
            logs: LogBroadcaster::new(settings.log_capacity),
            launcher,
            transform,
            settings,
            version,
            process: Mutex::new(None),
            restarting: AtomicBool::new(false),
            on_start: Mutex::new(Vec::new()),
            on_stop: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> CoreKind {
        self.kind
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn peer(&self) -> &str {
        &self.transform.peer
    }

    pub fn logs(&self) -> &Arc<LogBroadcaster> {
        &self.logs
    }

    pub fn subscribe_logs(&self) -> Subscriber {
        self.logs.subscribe()
    }

    pub fn state(&self) -> CoreState {
        if self.restarting.load(Ordering::Acquire) {
            CoreState::Restarting
        } else if self.is_running() {
            CoreState::Running
        } else {
            CoreState::Stopped
        }
    }

    /// True while a child exists and has not exited.
    pub fn is_running(&self) -> bool {
        match lock(&self.process).as_mut() {
            Some(running) => matches!(running.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.process).as_ref().and_then(|running| running.pid)
    }

    pub fn on_start<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.on_start).push(boxed_hook(hook));
    }

    pub fn on_stop<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.on_stop).push(boxed_hook(hook));
    }

    pub async fn start(&self, raw: &[u8]) -> Result<(), AgentError> {
        let document = ConfigDocument::build(raw, &self.transform)?;
        self.launch(document).await
    }

    pub async fn restart(&self, raw: &[u8]) -> Result<(), AgentError> {
        if self
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(event = "core_restart_in_flight", core = %self.kind);
            return Ok(());
        }
        let _guard = RestartGuard(&self.restarting);

        let document = ConfigDocument::build(raw, &self.transform)?;
        info!(event = "core_restarting", core = %self.kind);
        self.stop().await;
        self.launch(document).await
    }

    /// Terminates the running child, if any. Never fails; a child that
    /// ignores SIGTERM is killed once `terminate_timeout` elapses.
    pub async fn stop(&self) {
        let Some(mut running) = lock(&self.process).take() else {
            return;
        };
        if let Ok(Some(status)) = running.child.try_wait() {
            debug!(event = "core_already_exited", core = %self.kind, status = %status);
            return;
        }

        signal_group(self.kind, &mut running, Signal::Terminate);
        let timeout = self.settings.terminate_timeout;
        match tokio::time::timeout(timeout, running.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(event = "core_exited", core = %self.kind, status = %status);
            }
            Ok(Err(err)) => {
                warn!(event = "core_wait_failed", core = %self.kind, error = %err);
            }
            Err(_) => {
                warn!(event = "core_kill", core = %self.kind, timeout_ms = timeout.as_millis() as u64);
                signal_group(self.kind, &mut running, Signal::Kill);
                if let Err(err) = running.child.kill().await {
                    debug!(event = "core_kill_failed", core = %self.kind, error = %err);
                }
            }
        }

        info!(event = "core_stopped", core = %self.kind);
        self.fire(&self.on_stop, "stop");
    }

    async fn launch(&self, document: ConfigDocument) -> Result<(), AgentError> {
        let payload = document.to_json()?;
        if self.is_running() {
            self.stop().await;
        }

        let program = self.launcher.program().display().to_string();
        let mut child = self.launcher.run_command().spawn().map_err(|err| {
            AgentError::ProcessConflict(format!("failed to launch {program}: {err}"))
        })?;
        let pid = child.id();

        let (Some(stdout), Some(stderr), Some(mut stdin)) =
            (child.stdout.take(), child.stderr.take(), child.stdin.take())
        else {
            let _ = child.start_kill();
            return Err(AgentError::ProcessConflict(format!(
                "{program} started without piped stdio"
            )));
        };
        let echo = self.settings.echo_logs.then_some(self.kind);
        let reader = self.logs.spawn_reader(stdout, stderr, echo);

        let delivered = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await
        }
        .await;
        drop(stdin);
        if let Err(err) = delivered {
            let _ = child.start_kill();
            return Err(AgentError::ProcessConflict(format!(
                "failed to hand config to {program}: {err}"
            )));
        }

        let replaced = lock(&self.process).replace(RunningCore {
            child,
            pid,
            _reader: reader,
        });
        if replaced.is_some() {
            warn!(event = "core_handle_replaced", core = %self.kind);
        }

        info!(
            event = "core_started",
            core = %self.kind,
            version = self.version.as_deref().unwrap_or("unknown"),
            pid = pid.unwrap_or_default(),
            peer = %document.peer(),
            inbounds = ?document.inbound_tags()
        );
        self.fire(&self.on_start, "start");
        Ok(())
    }

    fn fire(&self, hooks: &Mutex<Vec<CoreHook>>, transition: &'static str) {
        let hooks = lock(hooks).clone();
        for hook in hooks {
            let kind = self.kind;
            tokio::spawn(async move {
                if let Err(err) = hook().await {
                    let failure = AgentError::HookFailure(format!("{err:#}"));
                    warn!(event = "core_hook_failed", core = %kind, transition, code = failure.code(), error = %failure);
                }
            });
        }
    }
}

fn boxed_hook<F, Fut>(hook: F) -> CoreHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || hook().boxed())
}

struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(kind: CoreKind, running: &mut RunningCore, signal: Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal as Posix};
    use nix::unistd::Pid;

    let Some(pgid) = running.pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let posix = match signal {
        Signal::Terminate => Posix::SIGTERM,
        Signal::Kill => Posix::SIGKILL,
    };
    // The group is gone once every member has been reaped.
    match killpg(Pid::from_raw(pgid), posix) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            debug!(event = "core_signal_failed", core = %kind, signal = posix.as_str(), error = %err);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_kind: CoreKind, running: &mut RunningCore, _signal: Signal) {
    let _ = running.child.start_kill();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
