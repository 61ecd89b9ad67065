//! API request handlers

pub mod broadcasts;
pub mod events;
pub mod health;
pub mod webhooks;
