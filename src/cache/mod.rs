//! Response caching for the offline proxy.
//!
//! This module provides:
//! - Named cache generations, versioned so a new release can retire old ones
//! - A storage seam with in-memory and SQLite backends
//! - The strategy engine that answers a request from cache, network or both

mod generations;
mod layer;
mod storage;
mod traits;

pub use generations::{CacheNames, CachePurpose};
pub use layer::StrategyEngine;
pub use storage::{MemoryStorage, SqliteStorage};
pub use traits::{CacheSource, CacheStorage, Served, StoredResponse};
