//! # Sessions
//!
//! - **state**: the idle/listening/thinking/speaking transition table
//! - **machine**: a live session and the task that drives its state machine
//! - **registry**: the process-wide session table

pub mod machine;
pub mod registry;
pub mod state;

pub use machine::{SessionContext, SessionEvent};
pub use registry::SessionRegistry;
pub use state::SessionState;
