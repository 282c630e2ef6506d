//! Betfair Exchange Stream API client.
//!
//! `wire` frames newline-delimited JSON over the TLS connection and
//! transparently inflates gzip frames; `client` drives the handshake
//! (authenticate, heartbeat request, market subscription with resume clocks).

pub mod client;
pub mod wire;

pub use client::{build_subscription_message, StreamClient};
pub use wire::{StreamConn, StreamError};
