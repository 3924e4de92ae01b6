// 异步缓存模块

mod entry;
mod expiring;

pub use entry::{CacheLookup, PendingValue};
pub use expiring::{
    ExpiringAsyncCache, ExpiringCacheConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_TTL,
};
