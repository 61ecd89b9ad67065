//! Campaign Scheduler
//!
//! The broadcast state machine, its validation rules and the periodic
//! worker that promotes and drives broadcasts.

mod manager;
pub mod state;
pub mod validation;
mod worker;

pub use manager::BroadcastManager;
pub use state::{can_transition, ensure_transition};
pub use worker::{DispatchWorker, TickSummary};
