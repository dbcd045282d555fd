//! # cablewatch-core
//!
//! Shared vocabulary for the cablewatch crates:
//!
//! - **Identity**: [`ChannelIdentity`], the subscription key and its wire identifier
//! - **Cursor**: [`LastSeenCursor`], the caller-owned resume marker
//! - **Records**: [`OutboundEventRecord`], the unit written to the consumer sink
//! - **Errors**: [`StreamError`] and [`DecodeError`] via `thiserror`
//! - **Logging**: `tracing` subscriber setup
//! - **Metrics**: metric name constants shared across crates

#![deny(unsafe_code)]

pub mod cursor;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod records;

pub use cursor::LastSeenCursor;
pub use errors::{DecodeError, Result, StreamError};
pub use identity::ChannelIdentity;
pub use records::{BATCH_EVENT, OutboundEventRecord};
