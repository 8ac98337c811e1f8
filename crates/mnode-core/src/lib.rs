//! Node-side control of proxy-core subprocesses for a single remote
//! controller: supervision, log fan-out, session admission and the RPC
//! surface the agent binary serves.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod launcher;
pub mod ring;
pub mod rpc;
pub mod service;
pub mod session;
pub mod subscription;
pub mod supervisor;
pub mod transform;

pub use config::{AgentConfig, CoreKind, CoreSettings, DispatchSettings, SupervisorSettings, TlsMaterial};
pub use error::AgentError;
pub use service::AgentService;
pub use session::{Admission, ControllerLink};
