//! RPC surface exposed to the admitted controller.
//!
//! Every call names the link it arrived on. Supervisors are created lazily
//! per session and core kind, stamped with the session's peer and wired to
//! the controller callbacks it declared.

use std::sync::Arc;

use tracing::debug;

use crate::config::{AgentConfig, CoreKind};
use crate::error::AgentError;
use crate::session::{Admission, ControllerLink, SessionGuard};
use crate::subscription::{LogSink, LogSubscription};
use crate::supervisor::CoreSupervisor;
use crate::transform::TransformContext;

pub struct AgentService<L: ControllerLink> {
    config: Arc<AgentConfig>,
    sessions: SessionGuard<L>,
}

impl<L: ControllerLink> AgentService<L> {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        let sessions = SessionGuard::new(config.probe_timeout);
        Self { config, sessions }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionGuard<L> {
        &self.sessions
    }

    pub async fn connect(&self, link: Arc<L>) -> Admission {
        self.sessions.on_connect(link).await
    }

    pub async fn disconnect(&self, link: &L) -> bool {
        self.sessions.on_disconnect(link).await
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    pub fn is_enabled(&self, kind: CoreKind) -> bool {
        self.config.core(kind).enabled
    }

    pub async fn start(&self, link: &Arc<L>, kind: CoreKind, raw: &[u8]) -> Result<(), AgentError> {
        let supervisor = self.supervisor_for(link, kind).await?;
        supervisor.start(raw).await
    }

    pub async fn stop(&self, link: &Arc<L>, kind: CoreKind) -> Result<(), AgentError> {
        match self.sessions.core(link, kind).await? {
            Some(supervisor) => supervisor.stop().await,
            None => debug!(event = "stop_without_core", core = %kind),
        }
        Ok(())
    }

    /// Restarts the session's core, or starts it when there is none yet.
    pub async fn restart(&self, link: &Arc<L>, kind: CoreKind, raw: &[u8]) -> Result<(), AgentError> {
        match self.sessions.core(link, kind).await? {
            Some(supervisor) => supervisor.restart(raw).await,
            None => self.start(link, kind, raw).await,
        }
    }

    pub async fn version(&self, link: &Arc<L>, kind: CoreKind) -> Result<Option<String>, AgentError> {
        let existing = self.sessions.core(link, kind).await?;
        if !self.is_enabled(kind) {
            return Ok(None);
        }
        match existing {
            Some(supervisor) => Ok(supervisor.version().map(str::to_string)),
            None => Ok(self.config.core(kind).launcher.probe_version().await),
        }
    }

    pub async fn fetch_logs(
        &self,
        link: &Arc<L>,
        kind: CoreKind,
        sink: Arc<dyn LogSink>,
    ) -> Result<LogSubscription, AgentError> {
        let existing = self.sessions.core(link, kind).await?;
        if !self.is_enabled(kind) {
            return Err(AgentError::CoreDisabled(kind));
        }
        match existing {
            Some(supervisor) => Ok(LogSubscription::spawn(
                supervisor.subscribe_logs(),
                sink,
                self.config.dispatch.clone(),
            )),
            None => Err(AgentError::NotRunning(kind)),
        }
    }

    async fn supervisor_for(&self, link: &Arc<L>, kind: CoreKind) -> Result<Arc<CoreSupervisor>, AgentError> {
        if !self.is_enabled(kind) {
            return Err(AgentError::CoreDisabled(kind));
        }
        if let Some(existing) = self.sessions.core(link, kind).await? {
            return Ok(existing);
        }

        let settings = self.config.core(kind);
        let transform = TransformContext {
            kind,
            peer: self.sessions.peer(link).await?,
            tls: self.config.tls.clone(),
            allowed_inbounds: settings.inbounds.clone(),
        };
        let supervisor =
            CoreSupervisor::new(settings.launcher.clone(), transform, self.config.supervisor.clone()).await;
        register_controller_hooks(&supervisor, link);
        debug!(
            event = "core_supervisor_created",
            core = %kind,
            version = supervisor.version().unwrap_or("unknown")
        );
        self.sessions.install_core(link, Arc::new(supervisor)).await
    }
}

fn register_controller_hooks<L: ControllerLink>(supervisor: &CoreSupervisor, link: &Arc<L>) {
    let kind = supervisor.kind();
    for (name, on_start) in [(kind.start_event(), true), (kind.stop_event(), false)] {
        if !link.supports(name) {
            debug!(event = "controller_hook_missing", core = %kind, name);
            continue;
        }
        let link = Arc::clone(link);
        let hook = move || {
            let link = Arc::clone(&link);
            async move { link.notify(name) }
        };
        if on_start {
            supervisor.on_start(hook);
        } else {
            supervisor.on_stop(hook);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreSettings, DispatchSettings, SupervisorSettings, TlsMaterial};
    use crate::launcher::CoreLauncher;
    use crate::session::tests::FakeLink;
    use crate::supervisor::tests::{config_with, saved_tags, script_launcher, test_dir, wait_until, well_behaved_body};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn agent_config(
        xray: CoreLauncher,
        sing_box: Option<CoreLauncher>,
        allowed: &[&str],
        terminate_timeout: Duration,
    ) -> Arc<AgentConfig> {
        let inbounds: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        Arc::new(AgentConfig {
            xray: CoreSettings {
                enabled: true,
                launcher: xray,
                inbounds: inbounds.clone(),
            },
            sing_box: CoreSettings {
                enabled: sing_box.is_some(),
                launcher: sing_box
                    .unwrap_or_else(|| CoreLauncher::sing_box("/nonexistent/mnode/sing-box", "/tmp")),
                inbounds,
            },
            tls: TlsMaterial::default(),
            supervisor: SupervisorSettings {
                terminate_timeout,
                ..SupervisorSettings::default()
            },
            dispatch: DispatchSettings::default(),
            probe_timeout: Duration::from_millis(200),
        })
    }

    async fn connected(service: &AgentService<FakeLink>, capabilities: &[&str]) -> Arc<FakeLink> {
        let link = FakeLink::with_capabilities(1, Some("192.0.2.10"), capabilities);
        assert!(matches!(service.connect(link.clone()).await, Admission::Admitted { .. }));
        link
    }

    fn logs_script(dir: &Path) -> String {
        format!(
            "cat > '{}/config.json'\necho l1\necho l2\nsleep 0.7\necho l3\necho l4\necho l5\nexec sleep 30",
            dir.display()
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_hands_filtered_config_to_the_core_and_notifies_controller() {
        let dir = test_dir("service-filter");
        let service = AgentService::new(agent_config(
            script_launcher(&dir, &well_behaved_body(&dir)),
            None,
            &["a"],
            Duration::from_secs(5),
        ));
        let link = connected(&service, &["on_start", "on_stop"]).await;

        service
            .start(&link, CoreKind::Xray, &config_with(&["a", "b"]))
            .await
            .expect("start");
        wait_until("config file", || saved_tags(&dir).is_some()).await;
        assert_eq!(saved_tags(&dir), Some(vec!["a".to_string()]));
        wait_until("on_start", || link.notified() == vec!["on_start"]).await;

        service.stop(&link, CoreKind::Xray).await.expect("stop");
        wait_until("on_stop", || link.notified() == vec!["on_start", "on_stop"]).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_logs_batches_all_lines_in_order() {
        let dir = test_dir("service-logs");
        let service = AgentService::new(agent_config(
            script_launcher(&dir, &logs_script(&dir)),
            None,
            &[],
            Duration::from_secs(5),
        ));
        let link = connected(&service, &[]).await;
        service
            .start(&link, CoreKind::Xray, &config_with(&["a"]))
            .await
            .expect("start");

        let batches = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_batches = batches.clone();
        let sink = move |batch: &str| -> anyhow::Result<()> {
            sink_batches.lock().expect("batches").push(batch.to_string());
            Ok(())
        };
        let subscription = service
            .fetch_logs(&link, CoreKind::Xray, Arc::new(sink))
            .await
            .expect("fetch logs");

        let collected = batches.clone();
        wait_until("all lines", || collected.lock().expect("batches").concat() == "l1\nl2\nl3\nl4\nl5\n").await;
        subscription.stop().await;
        service.stop(&link, CoreKind::Xray).await.expect("stop");

        let batches = batches.lock().expect("batches").clone();
        assert!(batches.len() >= 2, "expected at least two batches: {batches:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fetch_logs_replays_output_of_a_crashed_core() {
        let dir = test_dir("service-crash");
        let body = "cat > /dev/null\necho 'fatal: bad inbound'\nexit 3";
        let service = AgentService::new(agent_config(
            script_launcher(&dir, body),
            None,
            &[],
            Duration::from_secs(5),
        ));
        let link = connected(&service, &[]).await;
        service
            .start(&link, CoreKind::Xray, &config_with(&["a"]))
            .await
            .expect("launch");
        let supervisor = service
            .sessions()
            .core(&link, CoreKind::Xray)
            .await
            .expect("owned")
            .expect("supervisor");
        wait_until("exit", || !supervisor.is_running()).await;
        wait_until("output", || supervisor.logs().lines() == vec!["fatal: bad inbound"]).await;

        let batches = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink_batches = batches.clone();
        let sink = move |batch: &str| -> anyhow::Result<()> {
            sink_batches.lock().expect("batches").push(batch.to_string());
            Ok(())
        };
        let subscription = service
            .fetch_logs(&link, CoreKind::Xray, Arc::new(sink))
            .await
            .expect("crashed core still serves its output");
        let collected = batches.clone();
        wait_until("replayed", || collected.lock().expect("batches").concat() == "fatal: bad inbound\n").await;
        subscription.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_kills_a_core_ignoring_sigterm() {
        let dir = test_dir("service-kill");
        let body = "trap '' TERM\ncat > /dev/null\necho ready\nwhile :; do sleep 0.1; done";
        let service = AgentService::new(agent_config(
            script_launcher(&dir, body),
            None,
            &[],
            Duration::from_millis(400),
        ));
        let link = connected(&service, &[]).await;
        service
            .start(&link, CoreKind::Xray, &config_with(&[]))
            .await
            .expect("start");
        let supervisor = service
            .sessions()
            .core(&link, CoreKind::Xray)
            .await
            .expect("owned")
            .expect("supervisor");
        wait_until("ready", || supervisor.logs().lines().contains(&"ready".to_string())).await;

        let began = Instant::now();
        service.stop(&link, CoreKind::Xray).await.expect("stop");
        assert!(began.elapsed() < Duration::from_secs(3));
        assert!(!supervisor.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calls_from_a_rejected_link_fail() {
        let dir = test_dir("service-rejected");
        let service = AgentService::new(agent_config(
            script_launcher(&dir, &well_behaved_body(&dir)),
            None,
            &[],
            Duration::from_secs(5),
        ));
        let _active = connected(&service, &[]).await;
        let intruder = FakeLink::new(2, Some("192.0.2.99"));
        assert!(matches!(
            service.connect(intruder.clone()).await,
            Admission::Rejected { .. }
        ));

        let raw = config_with(&["a"]);
        assert_eq!(
            service.start(&intruder, CoreKind::Xray, &raw).await,
            Err(AgentError::SessionRejected)
        );
        assert_eq!(service.stop(&intruder, CoreKind::Xray).await, Err(AgentError::SessionRejected));
        assert_eq!(
            service.version(&intruder, CoreKind::Xray).await,
            Err(AgentError::SessionRejected)
        );
        let sink = |_: &str| -> anyhow::Result<()> { Ok(()) };
        assert_eq!(
            service.fetch_logs(&intruder, CoreKind::Xray, Arc::new(sink)).await.err(),
            Some(AgentError::SessionRejected)
        );
        assert!(saved_tags(&dir).is_none());
    }

    #[tokio::test]
    async fn disabled_sing_box_is_reported_not_started() {
        let dir = test_dir("service-disabled");
        let service = AgentService::new(agent_config(
            script_launcher(&dir, &well_behaved_body(&dir)),
            None,
            &[],
            Duration::from_secs(5),
        ));
        let link = connected(&service, &["on_singbox_start"]).await;

        assert!(service.is_enabled(CoreKind::Xray));
        assert!(!service.is_enabled(CoreKind::SingBox));
        assert_eq!(
            service.start(&link, CoreKind::SingBox, &config_with(&[])).await,
            Err(AgentError::CoreDisabled(CoreKind::SingBox))
        );
        assert_eq!(service.version(&link, CoreKind::SingBox).await, Ok(None));
        assert_eq!(service.stop(&link, CoreKind::SingBox).await, Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_starts_when_nothing_runs_and_version_needs_no_process() {
        let dir = test_dir("service-restart");
        let launcher = script_launcher(&dir, &well_behaved_body(&dir));
        let service = AgentService::new(agent_config(
            launcher.clone(),
            Some(launcher),
            &[],
            Duration::from_secs(5),
        ));
        let link = connected(&service, &[]).await;

        assert_eq!(
            service.version(&link, CoreKind::SingBox).await,
            Ok(Some("1.9.3".to_string()))
        );
        let sink = |_: &str| -> anyhow::Result<()> { Ok(()) };
        assert_eq!(
            service.fetch_logs(&link, CoreKind::SingBox, Arc::new(sink)).await.err(),
            Some(AgentError::NotRunning(CoreKind::SingBox))
        );

        service
            .restart(&link, CoreKind::SingBox, &config_with(&["r"]))
            .await
            .expect("restart");
        wait_until("config file", || saved_tags(&dir) == Some(vec!["r".to_string()])).await;
        let supervisor = service
            .sessions()
            .core(&link, CoreKind::SingBox)
            .await
            .expect("owned")
            .expect("supervisor");
        assert!(supervisor.is_running());
        assert_eq!(supervisor.peer(), "192.0.2.10");

        assert!(service.disconnect(&link).await);
        assert!(!supervisor.is_running());
    }
}
