//! Core abstractions for the psych-timer session control plane.
//!
//! This crate provides the fundamental building blocks:
//! - `CommandMessage` / `StatusMessage` - Operator commands and session notices
//! - `EventLog` - Tab-delimited event log for external recording tools
//! - `SessionEngine` - Trait for the engine that executes trial runs
//! - `ServerConfig` - Configuration for the server and the reference engine
//! - `testing` - Recording engine for tests of code that drives an engine

pub mod config;
pub mod event_log;
pub mod message;
pub mod testing;
pub mod traits;

pub use config::{ConflictPolicy, ServerConfig};
pub use event_log::{EventLog, EventLogError, LogEvent};
pub use message::{Action, CommandMessage, StatusMessage, StatusReceiver, StatusSender};
pub use traits::{EngineError, EngineFactory, SessionEngine};
