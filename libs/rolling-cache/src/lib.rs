//! Rolling Cache
//!
//! Keeps the last N closed bars per stream in a TTL key-value store and
//! serves them as on-subscribe snapshots.
//!
//! - `window`: the bounded FIFO of closed bars
//! - `manager`: read/write policy (single-flight load on miss, append on close)
//! - `store`: the key-value collaborator (in-memory or Redis)
//! - `loader`: the historical REST collaborator

pub mod error;
pub mod loader;
pub mod manager;
pub mod store;
pub mod window;

pub use error::{CacheError, LoaderError};
pub use loader::{BinanceRestLoader, HistoricalLoader, DEFAULT_REST_URL};
pub use manager::{AppendOutcome, RollingCacheManager, WindowConfig};
pub use store::{CacheStore, MemoryStore, RedisStore};
pub use window::{PushOutcome, RollingWindow};
