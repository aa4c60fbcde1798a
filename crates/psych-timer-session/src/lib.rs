//! Session orchestration for the operator control plane.
//!
//! Provides:
//! - `Session` - One operator connection bound to its own engine
//! - `SessionRegistry` - Single-slot registry of the current session
//! - `Dispatcher` - Ordered consumer of operator commands

pub mod dispatcher;
pub mod registry;
pub mod session;

pub use dispatcher::{CommandSender, DispatchError, Dispatcher, Envelope};
pub use registry::{RegistryError, SessionRegistry};
pub use session::{Session, SessionId};
