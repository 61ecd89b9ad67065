//! Winner Selection for A/B tested broadcasts

mod selection;

pub use selection::{pick_winner, WinnerDecision, WinnerSelector, WinnerTrigger};
