//! 缓存条目

use futures::future::{BoxFuture, Shared};
use std::fmt;
use tokio::time::Instant;

/// 进行中的异步计算
///
/// 可克隆，所有等待方得到同一个结果；计算失败时结果为 None
pub type PendingValue<V> = Shared<BoxFuture<'static, Option<V>>>;

/// 查询结果
#[derive(Clone)]
pub enum CacheLookup<V>
where
    V: Clone,
{
    /// 计算尚未完成
    Pending(PendingValue<V>),
    /// 已就绪的值
    Ready(V),
}

impl<V> CacheLookup<V>
where
    V: Clone,
{
    pub fn is_pending(&self) -> bool {
        matches!(self, CacheLookup::Pending(_))
    }

    /// 等待结果
    pub async fn resolve(self) -> Option<V> {
        match self {
            CacheLookup::Pending(future) => future.await,
            CacheLookup::Ready(value) => Some(value),
        }
    }
}

impl<V> fmt::Debug for CacheLookup<V>
where
    V: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLookup::Pending(_) => f.write_str("Pending"),
            CacheLookup::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
        }
    }
}

/// 缓存条目
///
/// 计算完成后才开始计算过期时间
pub(crate) enum CacheEntry<V>
where
    V: Clone,
{
    Pending {
        future: PendingValue<V>,
        /// 写入代次，完成时只回写自己创建的条目
        generation: u64,
    },
    Resolved {
        /// 计算失败时为 None
        value: Option<V>,
        expires_at: Instant,
    },
}

impl<V> CacheEntry<V>
where
    V: Clone,
{
    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            CacheEntry::Pending { .. } => false,
            CacheEntry::Resolved { expires_at, .. } => *expires_at <= now,
        }
    }

    pub fn lookup(&self) -> Option<CacheLookup<V>> {
        match self {
            CacheEntry::Pending { future, .. } => Some(CacheLookup::Pending(future.clone())),
            CacheEntry::Resolved { value, .. } => value.clone().map(CacheLookup::Ready),
        }
    }
}
