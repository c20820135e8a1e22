//! Control plane for the relay
//!
//! Owns the two pieces of state shared by every handler: the backend
//! registry (who is attached, on which connection, and whether we are
//! waiting for them to come back) and the pending request table (which
//! public caller is waiting on which stream).

pub mod auth;
pub mod handler;
pub mod pending_requests;
pub mod registry;
pub mod session;
pub mod task_tracker;

pub use auth::{AuthError, CredentialVerifier, JwtVerifier};
pub use handler::{ControlHandler, HeartbeatConfig};
pub use pending_requests::{
    CorrelationId, PendingError, PendingInfo, PendingOutcome, PendingRequests,
};
pub use registry::{
    ActiveBackend, BackendInfo, BackendRegistry, BackendState, BackendStatus, DuplicatePolicy,
    Registration, RegistryConfig, RegistryError,
};
pub use session::SessionTicket;
pub use task_tracker::TaskTracker;
