//! memkeep - persistent memory engine for AI assistants
//!
//! Stores short natural-language facts, routes each through one of five
//! semantic gates, and serves them back through hybrid dense + lexical
//! retrieval. Memories decay over time, are linked in a typed graph, and are
//! periodically consolidated by a reflection cycle.

pub mod api;
pub mod classifier;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod graph;
pub mod indexing;
pub mod memory;
pub mod privacy;
pub mod reflection;
pub mod retrieval;
pub mod storage;
pub mod testing;

pub use engine::MemoryEngine;
pub use error::MemkeepError;
