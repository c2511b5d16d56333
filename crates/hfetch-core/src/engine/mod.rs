//! Fetch engine
//!
//! Transfers run as tasks on the engine's own runtime. Each task streams one
//! response body, consulting and feeding the persistent store, and queues
//! its events on the caller's [`crate::Fetch`] handle.

mod manager;
mod persistence;
mod rate_limiter;
mod transfer_task;

pub use manager::FetchEngine;
pub use persistence::FetchStore;
pub use rate_limiter::RateLimiter;

pub(crate) use transfer_task::{TransferRequest, TransferSettings, TransferTask};
