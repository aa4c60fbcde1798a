//! Reference session engine.
//!
//! Provides:
//! - `TimerEngine` - One timed run at a time with a per-subject event log
//! - `TimerEngineFactory` - Builds a `TimerEngine` per operator session
//! - `RunSlot` - The one run slot those engines share

pub mod timer;

pub use timer::{RunSettings, RunSlot, TimerEngine, TimerEngineFactory};
