//! Single-controller admission and session-scoped core ownership.
//!
//! At most one controller link is active. A newcomer is admitted only when
//! no session exists or the current one fails its liveness probe. Every
//! supervisor created for a session is stopped when that session ends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CoreKind;
use crate::error::AgentError;
use crate::supervisor::CoreSupervisor;

/// The agent's view of one controller connection.
pub trait ControllerLink: Send + Sync + 'static {
    /// Unique per accepted connection.
    fn id(&self) -> u64;

    /// Remote address of the underlying transport, if it can be read.
    fn peer(&self) -> Option<String>;

    /// No-op round trip. `false` on timeout or a closed transport.
    fn probe(&self, timeout: Duration) -> BoxFuture<'_, bool>;

    fn close(&self);

    /// Whether the controller declared the named callback.
    fn supports(&self, event: &str) -> bool;

    /// Invokes a controller callback without waiting for it to complete.
    fn notify(&self, event: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { peer: String },
    Rejected { existing_peer: String },
}

struct ActiveSession<L> {
    link: Arc<L>,
    peer: Option<String>,
    cores: HashMap<CoreKind, Arc<CoreSupervisor>>,
}

pub struct SessionGuard<L: ControllerLink> {
    active: Mutex<Option<ActiveSession<L>>>,
    probe_timeout: Duration,
}

impl<L: ControllerLink> SessionGuard<L> {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            active: Mutex::new(None),
            probe_timeout,
        }
    }

    pub async fn on_connect(&self, candidate: Arc<L>) -> Admission {
        let candidate_peer = candidate.peer();
        let superseded = {
            let mut active = self.active.lock().await;
            let superseded = match active.take() {
                Some(existing) => {
                    let alive = match &existing.peer {
                        Some(_) => existing.link.probe(self.probe_timeout).await,
                        None => false,
                    };
                    if alive {
                        let existing_peer = existing.peer.clone().unwrap_or_default();
                        warn!(
                            event = "session_rejected",
                            existing_peer = %existing_peer,
                            candidate_peer = candidate_peer.as_deref().unwrap_or("unknown"),
                            candidate_id = candidate.id()
                        );
                        *active = Some(existing);
                        candidate.close();
                        return Admission::Rejected { existing_peer };
                    }
                    warn!(
                        event = "session_lost",
                        peer = existing.peer.as_deref().unwrap_or("unknown"),
                        conn_id = existing.link.id()
                    );
                    Some(existing)
                }
                None => None,
            };

            info!(
                event = "session_admitted",
                peer = candidate_peer.as_deref().unwrap_or("unknown"),
                conn_id = candidate.id()
            );
            *active = Some(ActiveSession {
                link: candidate,
                peer: candidate_peer.clone(),
                cores: HashMap::new(),
            });
            superseded
        };

        if let Some(old) = superseded {
            old.link.close();
            stop_cores(old.cores).await;
        }
        Admission::Admitted {
            peer: candidate_peer.unwrap_or_default(),
        }
    }

    /// Ends the session if `link` owns it; ignored for superseded links.
    pub async fn on_disconnect(&self, link: &L) -> bool {
        let ended = {
            let mut active = self.active.lock().await;
            match active.as_ref() {
                Some(session) if session.link.id() == link.id() => active.take(),
                _ => None,
            }
        };
        let Some(session) = ended else {
            debug!(event = "stale_disconnect_ignored", conn_id = link.id());
            return false;
        };
        info!(
            event = "session_closed",
            peer = session.peer.as_deref().unwrap_or("unknown"),
            cores = session.cores.len()
        );
        stop_cores(session.cores).await;
        true
    }

    /// Tears down whatever session is active. Used on agent shutdown.
    pub async fn shutdown(&self) {
        let ended = self.active.lock().await.take();
        if let Some(session) = ended {
            info!(event = "session_shutdown", peer = session.peer.as_deref().unwrap_or("unknown"));
            session.link.close();
            stop_cores(session.cores).await;
        }
    }

    pub async fn is_active(&self, link: &L) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.link.id() == link.id())
    }

    #[cfg(test)]
    pub(crate) async fn active_peer(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|session| session.peer.clone())
    }

    /// Peer identity recorded for `link`'s session.
    pub async fn peer(&self, link: &L) -> Result<String, AgentError> {
        let active = self.active.lock().await;
        let session = owned_by(&active, link)?;
        Ok(session.peer.clone().unwrap_or_default())
    }

    pub async fn core(
        &self,
        link: &L,
        kind: CoreKind,
    ) -> Result<Option<Arc<CoreSupervisor>>, AgentError> {
        let active = self.active.lock().await;
        let session = owned_by(&active, link)?;
        Ok(session.cores.get(&kind).cloned())
    }

    /// Attaches `supervisor` to `link`'s session unless one of the same kind
    /// is already there, in which case the existing one is returned.
    pub async fn install_core(
        &self,
        link: &L,
        supervisor: Arc<CoreSupervisor>,
    ) -> Result<Arc<CoreSupervisor>, AgentError> {
        let mut active = self.active.lock().await;
        let session = match active.as_mut() {
            Some(session) if session.link.id() == link.id() => session,
            _ => return Err(AgentError::SessionRejected),
        };
        Ok(session
            .cores
            .entry(supervisor.kind())
            .or_insert(supervisor)
            .clone())
    }
}

fn owned_by<'a, L: ControllerLink>(
    active: &'a Option<ActiveSession<L>>,
    link: &L,
) -> Result<&'a ActiveSession<L>, AgentError> {
    match active {
        Some(session) if session.link.id() == link.id() => Ok(session),
        _ => Err(AgentError::SessionRejected),
    }
}

async fn stop_cores(cores: HashMap<CoreKind, Arc<CoreSupervisor>>) {
    for (kind, supervisor) in cores {
        debug!(event = "session_core_stop", core = %kind);
        supervisor.stop().await;
    }
}
