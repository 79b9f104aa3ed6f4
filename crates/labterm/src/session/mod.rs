//! Session management module.
//!
//! Handles the lifecycle of lab sessions: provisioning a sandbox, attaching
//! terminals and releasing the sandbox again.

mod error;
mod models;
mod registry;
mod service;

pub use error::{LifecycleError, LifecycleResult};
pub use models::{CreatedSession, Session, SessionState};
pub use registry::{AttachTicket, BridgeHandle, Closing, Reconcile, SessionRegistry};
pub use service::{SessionService, SessionServiceConfig};
