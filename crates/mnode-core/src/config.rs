//! Agent configuration, built once at startup and shared read-only.
//!
//! Nothing in the crate reads process-wide settings on its own: the binary
//! resolves CLI flags and environment variables into an [`AgentConfig`] and
//! hands it to the service, which passes the relevant pieces down to each
//! supervisor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::launcher::CoreLauncher;

pub const DEFAULT_LOG_CAPACITY: usize = 100;
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(600);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The proxy-core backends a node can supervise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoreKind {
    #[default]
    Xray,
    SingBox,
}

impl CoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreKind::Xray => "xray",
            CoreKind::SingBox => "sing_box",
        }
    }

    /// Controller callback invoked after this core starts.
    pub fn start_event(&self) -> &'static str {
        match self {
            CoreKind::Xray => "on_start",
            CoreKind::SingBox => "on_singbox_start",
        }
    }

    /// Controller callback invoked after this core stops.
    pub fn stop_event(&self) -> &'static str {
        match self {
            CoreKind::Xray => "on_stop",
            CoreKind::SingBox => "on_singbox_stop",
        }
    }
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local trust material stamped onto every config document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    /// How long `stop` waits after the graceful signal before killing.
    pub terminate_timeout: Duration,
    /// Ring buffer capacity for captured core output.
    pub log_capacity: usize,
    /// Mirror every captured line into the agent's own debug log.
    pub echo_logs: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            log_capacity: DEFAULT_LOG_CAPACITY,
            echo_logs: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Minimum spacing between two sink invocations.
    pub interval: Duration,
    /// Idle wait when the subscriber buffer is empty.
    pub poll_interval: Duration,
    /// Upper bound on `LogSubscription::stop`.
    pub join_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FLUSH_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Per-backend settings.
#[derive(Clone, Debug)]
pub struct CoreSettings {
    pub enabled: bool,
    pub launcher: CoreLauncher,
    /// Inbound tags allowed through to the core; empty keeps every inbound.
    pub inbounds: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub xray: CoreSettings,
    pub sing_box: CoreSettings,
    pub tls: TlsMaterial,
    pub supervisor: SupervisorSettings,
    pub dispatch: DispatchSettings,
    pub probe_timeout: Duration,
}

impl AgentConfig {
    pub fn core(&self, kind: CoreKind) -> &CoreSettings {
        match kind {
            CoreKind::Xray => &self.xray,
            CoreKind::SingBox => &self.sing_box,
        }
    }
}

/// Splits a comma separated allow-list, dropping blanks.
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
