// =============================================================================
// Storage layer — Redis keyspace, K-line series, symbol registry
// =============================================================================

pub mod keys;
pub mod kline;
pub mod kv;
pub mod registry;

pub use kline::{KlineStore, PutOutcome};
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use registry::SymbolRegistry;
