//! Orderflow - order ingestion with dual-sink fan-out.
//!
//! Orders accepted over HTTP are announced on a broadcast bus and queued on
//! a durable work queue. A notifier logs the broadcasts; a processor drains
//! the queue one message at a time into a search index.

pub mod bus;
pub mod config;
pub mod ingress;
pub mod notifier;
pub mod order;
pub mod processor;
pub mod search;
pub mod utils;
