//! hfetch Core - Fetch Engine
//!
//! Asynchronous HTTP fetches behind a callback API: describe a request with
//! a [`FetchAttr`], submit it to a [`FetchEngine`] and get a [`Fetch`] handle
//! back immediately. Progress, success and error are reported through the
//! descriptor's callbacks; [`Fetch::wait`] blocks a synchronous caller until
//! the transfer is done and [`Fetch::close`] releases (or aborts) it.
//!
//! Bodies can be kept in a persistent store keyed by destination path, from
//! which later fetches are served, resumed or replaced.

mod attr;
pub mod config;
mod engine;
mod error;
mod event;
mod handle;

pub use attr::{FetchAttr, FetchCallback, UserData};
pub use engine::{FetchEngine, FetchStore, RateLimiter};
pub use error::{FetchError, OperationError};
pub use handle::Fetch;

pub use hfetch_types::{
    BoundedString, BoundedStringError, DestinationPath, EngineConfig, FetchAttributes,
    FetchFlags, ProxyMode, ProxySettings, RequestMethod, StorageMode, StoredEntry,
};
