//! # cablewatch-stream
//!
//! Real-time subscription client for an ActionCable-style pub/sub gateway.
//!
//! - [`codec`]: frame decoding into [`codec::InboundFrame`], subscribe encoding
//! - [`handshake`]: welcome → subscribe → confirm state machine
//! - [`classifier`]: identifier, conversation, allowlist and direction filtering
//! - [`normalize`]: compact consumer shape for message payloads
//! - [`debounce`]: per-conversation coalescing of `message.created`
//! - [`emitter`]: single-writer line-delimited JSON output
//! - [`client`]: the read loop, timers and cancellation tied together

#![deny(unsafe_code)]

pub mod classifier;
pub mod client;
pub mod codec;
pub mod config;
pub mod debounce;
pub mod emitter;
pub mod handshake;
pub mod normalize;

pub use client::StreamClient;
pub use config::{DebounceConfig, StreamConfig, StreamFilter};
