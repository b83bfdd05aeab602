//! Cache-first data plane: a TTL key-value layer with typed accessors,
//! a circuit breaker, and the write-behind queue.
//!
//! Every upper component reads through `CacheHandle`; the durable store is
//! only touched on miss (by callers) or by the flusher in `herald-store`.

pub mod backend;
pub mod breaker;
pub mod memory;
pub mod queue;
pub mod redis_backend;
pub mod store;

mod error;

pub use backend::KvBackend;
pub use breaker::CircuitBreaker;
pub use error::{CacheError, Result};
pub use memory::MemoryBackend;
pub use queue::{QueueItem, WriteOp};
pub use store::{CacheHandle, CacheTtls};
