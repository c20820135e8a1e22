//! Backend side of the relay
//!
//! Keeps one control connection to the relay alive (registering, resuming
//! with a persisted session ticket, backing off between attempts) and
//! answers every relay-opened stream by calling the local service.

pub mod agent;
pub mod config;
pub mod forwarder;
pub mod reconnect;
pub mod ticket;

pub use agent::{Agent, AgentError};
pub use config::{AgentConfig, AgentOverrides, ConfigError};
pub use forwarder::{ForwardError, Forwarder};
pub use reconnect::{transition, Backoff, ConnectionState, Effect, Event, ReconnectError};
pub use ticket::{SessionTicketStore, StoredTicket, TicketError};
