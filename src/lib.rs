//! Betfair exchange stream recorder.
//!
//! Maintains a resumable authenticated connection to the exchange stream,
//! demultiplexes the multi-market change feed into per-market NDJSON logs
//! enriched with catalogue metadata, and archives each log to S3 when its
//! market settles.

pub mod auth;
pub mod config;
pub mod files;
pub mod recorder;
pub mod rest;
pub mod storage;
pub mod stream;
