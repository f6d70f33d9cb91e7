//! I/O utilities
//!
//! Currently the pooled message-buffer allocator used by every stage of the
//! outbound pipeline.

mod buffer_pool;

pub use buffer_pool::{BufferPoolStats, BufferPoolStatsSnapshot, MessageBufferPool, PooledBuffer};
