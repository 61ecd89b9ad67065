//! Provider webhook ingestion
//!
//! Each provider module decodes its own wire format; [`EventNormalizer`]
//! maps the result onto [`DeliveryEvent`](mailcast_storage::models::DeliveryEvent)s.

pub mod mailgun;
pub mod mailjet;
mod normalizer;
pub mod payload;
pub mod postmark;
pub mod ses;
pub mod signature;
pub mod sparkpost;

pub use normalizer::{EventNormalizer, IngestOutcome};
pub use payload::{ParsedEvent, ProviderPayload};
