//! Betfair Sports API (JSON-RPC) client.
//!
//! Only `listMarketCatalogue` is consumed here; the catalogue supplies the
//! market/event/runner names that the stream payloads omit.

pub mod client;
pub mod types;

pub use client::RestClient;
pub use types::{
    Competition, Event, EventType, MarketCatalogue, MarketDescription, MarketFilter,
    MarketProjection, MarketSort, RunnerCatalog,
};
