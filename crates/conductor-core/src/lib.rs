pub mod approvals;
pub mod breaker;
pub mod config;
pub mod context;
pub mod event_bus;
pub mod idempotency;
pub mod journal;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod workers;

pub use approvals::*;
pub use breaker::*;
pub use config::*;
pub use context::*;
pub use event_bus::*;
pub use idempotency::*;
pub use journal::*;
pub use metrics::*;
pub use pipeline::*;
pub use queue::*;
pub use rate_limit::*;
pub use retry::*;
pub use router::*;
pub use workers::*;
