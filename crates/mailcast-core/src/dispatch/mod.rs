//! Send Orchestrator and its building blocks
//!
//! Turns a sending broadcast into rate-limited batches of transport calls
//! with idempotent send records and a persisted cursor.

pub mod assignment;
pub mod message;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod template;
pub mod transport;
pub mod window;

pub use orchestrator::{CycleReport, CycleStats, Orchestrator};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use template::{FileTemplates, InMemoryTemplates, Personalizer, TemplateRenderer};
pub use transport::{MockTransport, OutboundMessage, SmtpTransport, Transport, TransportError};
pub use window::SendWindow;
