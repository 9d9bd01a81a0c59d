//! Upstream dispatch engine: account/token lifecycle, sliding-window rate
//! limiting, priority-ordered provider selection with failover, and the
//! streaming-aware request path.

pub mod account;
pub mod copilot;
pub mod limiter;
pub mod openai_compat;
pub mod pool;
pub mod provider;
pub mod relay;
pub mod router;
pub mod usage;

pub use provider::{DispatchError, Lease, Provider, Reply};
pub use router::ProviderRouter;
