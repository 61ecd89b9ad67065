//! Audience resolution and snapshots

mod resolver;

pub use resolver::AudienceResolver;
