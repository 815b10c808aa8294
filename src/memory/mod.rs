pub mod lifetime;
pub mod pool;

pub use lifetime::Lifetime;
pub use pool::{BlockId, MemoryPool, PoolRegistry, PoolStats};
