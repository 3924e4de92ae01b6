//! 带过期时间的异步缓存
//!
//! 缓存进行中的异步计算，相同 key 的并发查询共享同一个计算结果
//!
//! ## 设计要点
//! - 进行中的计算以 `Shared` future 存储，`get` 返回其克隆，不会重复发起计算
//! - 计算完成后才写入过期时间（失败时写入 None），过期时间从完成时刻算起
//! - 同一 key 被重新写入后，旧计算完成时不会覆盖新条目
//! - 读取时惰性淘汰过期条目，另有后台清理任务定期扫描，缓存清空后自动停止

use super::entry::{CacheEntry, CacheLookup, PendingValue};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt::{self, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 默认过期时间
pub const DEFAULT_TTL: Duration = Duration::from_millis(2000);
/// 默认清理间隔
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(5000);

/// 缓存配置
#[derive(Debug, Clone)]
pub struct ExpiringCacheConfig {
    /// 计算完成后的存活时间
    pub ttl: Duration,
    /// 后台清理间隔
    pub cleanup_interval: Duration,
}

impl Default for ExpiringCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

struct CacheShared<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    entries: DashMap<K, CacheEntry<V>>,
    config: ExpiringCacheConfig,
    /// 条目写入代次
    next_generation: AtomicU64,
    /// 后台清理任务
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    warned_no_runtime: AtomicBool,
}

impl<K, V> CacheShared<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn runtime(&self) -> Option<Handle> {
        match Handle::try_current() {
            Ok(runtime) => Some(runtime),
            Err(_) => {
                if !self.warned_no_runtime.swap(true, Ordering::SeqCst) {
                    warn!("[ExpiringCache] 当前不在 tokio 运行时中，过期条目只在读取时淘汰");
                }
                None
            }
        }
    }

    /// 确保后台清理任务在运行
    fn ensure_sweep(self: &Arc<Self>) {
        let mut handle = self.sweep_handle.lock();
        if handle.is_some() {
            return;
        }
        if let Some(runtime) = self.runtime() {
            *handle = Some(runtime.spawn(run_sweep_loop(
                Arc::downgrade(self),
                self.config.cleanup_interval,
            )));
            debug!(
                "[ExpiringCache] 后台清理任务已启动, 间隔 {:?}",
                self.config.cleanup_interval
            );
        }
    }

    fn stop_sweep(&self) {
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
            debug!("[ExpiringCache] 后台清理任务已停止");
        }
    }

    /// 计算完成，只回写自己创建的条目
    fn settle(&self, key: &K, generation: u64, value: Option<V>) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            let owned = matches!(
                *entry,
                CacheEntry::Pending { generation: g, .. } if g == generation
            );
            if owned {
                *entry = CacheEntry::Resolved {
                    value,
                    expires_at: Instant::now() + self.config.ttl,
                };
            }
        }
    }

    /// 清理过期条目，缓存清空后停止后台清理任务
    fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });

        // 持锁判断是否为空，与 ensure_sweep 串行
        let mut handle = self.sweep_handle.lock();
        if self.entries.is_empty() {
            if let Some(handle) = handle.take() {
                handle.abort();
                debug!("[ExpiringCache] 缓存已空，后台清理任务停止");
            }
        }

        if removed > 0 {
            debug!("[ExpiringCache] 清理了 {} 个过期条目", removed);
        }
        removed
    }

    fn is_sweep_running(&self) -> bool {
        self.sweep_handle.lock().is_some()
    }
}

impl<K, V> Drop for CacheShared<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.get_mut().take() {
            handle.abort();
        }
    }
}

/// 后台清理循环
async fn run_sweep_loop<K, V>(weak: Weak<CacheShared<K, V>>, interval: Duration)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        tokio::time::sleep(interval).await;
        match weak.upgrade() {
            Some(shared) => {
                shared.cleanup();
                if !shared.is_sweep_running() {
                    break;
                }
            }
            None => break,
        }
    }
}

/// 带过期时间的异步缓存
///
/// 克隆得到的是同一个缓存的句柄
pub struct ExpiringAsyncCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    shared: Arc<CacheShared<K, V>>,
}

impl<K, V> Clone for ExpiringAsyncCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> ExpiringAsyncCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: ExpiringCacheConfig) -> Self {
        info!(
            "异步缓存已创建: ttl={:?}, 清理间隔={:?}",
            config.ttl, config.cleanup_interval
        );
        Self {
            shared: Arc::new(CacheShared {
                entries: DashMap::new(),
                config,
                next_generation: AtomicU64::new(0),
                sweep_handle: Mutex::new(None),
                warned_no_runtime: AtomicBool::new(false),
            }),
        }
    }

    /// 写入已就绪的值
    pub fn set(&self, key: K, value: V) {
        let expires_at = Instant::now() + self.shared.config.ttl;
        self.shared.entries.insert(
            key,
            CacheEntry::Resolved {
                value: Some(value),
                expires_at,
            },
        );
        self.shared.ensure_sweep();
    }

    /// 写入进行中的异步计算
    ///
    /// 立即对 `get` / `has` 可见；计算成功后写入值，失败后写入空值，
    /// 两种情况都从完成时刻开始计算过期时间
    pub fn set_pending<F, E>(&self, key: K, future: F)
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
        E: Display + Send,
    {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(&self.shared);
        let settle_key = key.clone();

        let pending: PendingValue<V> = async move {
            let value = match future.await {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("[ExpiringCache] 异步计算失败，缓存空值: {}", e);
                    None
                }
            };
            if let Some(shared) = weak.upgrade() {
                shared.settle(&settle_key, generation, value.clone());
            }
            value
        }
        .boxed()
        .shared();

        self.shared.entries.insert(
            key,
            CacheEntry::Pending {
                future: pending.clone(),
                generation,
            },
        );

        // 没有等待方时也要推进到完成
        if let Some(runtime) = self.shared.runtime() {
            runtime.spawn(pending.map(|_| ()));
        }
        self.shared.ensure_sweep();
    }

    /// 查询
    ///
    /// # 返回
    /// - `Some(CacheLookup::Pending)`: 计算进行中
    /// - `Some(CacheLookup::Ready)`: 未过期的值
    /// - `None`: 不存在、已过期（同时淘汰）或计算失败
    pub fn get(&self, key: &K) -> Option<CacheLookup<V>> {
        let now = Instant::now();
        {
            let entry = self.shared.entries.get(key)?;
            if !entry.is_expired(now) {
                return entry.lookup();
            }
        }

        self.shared
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// 是否存在（与 `get` 相同的判定，过期条目同时淘汰）
    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// 查询并移除
    pub fn pop(&self, key: &K) -> Option<CacheLookup<V>> {
        let lookup = self.get(key);
        self.shared.entries.remove(key);
        lookup
    }

    /// 剩余存活时间，计算进行中或不存在时返回 None
    pub fn ttl(&self, key: &K) -> Option<Duration> {
        match self.shared.entries.get(key)?.value() {
            CacheEntry::Pending { .. } => None,
            CacheEntry::Resolved { expires_at, .. } => {
                Some(expires_at.saturating_duration_since(Instant::now()))
            }
        }
    }

    /// 查询并等待结果
    pub async fn resolve(&self, key: &K) -> Option<V> {
        self.get(key)?.resolve().await
    }

    /// 清理过期条目
    ///
    /// # 返回
    /// 清理的条目数
    pub fn cleanup(&self) -> usize {
        self.shared.cleanup()
    }

    /// 清空缓存并停止后台清理任务
    pub fn clear(&self) {
        self.shared.stop_sweep();
        self.shared.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// 后台清理任务是否在运行
    pub fn is_sweep_running(&self) -> bool {
        self.shared.is_sweep_running()
    }

    pub fn config(&self) -> &ExpiringCacheConfig {
        &self.shared.config
    }
}

impl<K, V> Default for ExpiringAsyncCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ExpiringCacheConfig::default())
    }
}

impl<K, V> fmt::Debug for ExpiringAsyncCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringAsyncCache")
            .field("config", &self.shared.config)
            .field("len", &self.shared.entries.len())
            .field("sweep_running", &self.shared.sweep_handle.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn cache() -> ExpiringAsyncCache<String, u32> {
        ExpiringAsyncCache::default()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    /// 让已唤醒的任务跑一轮
    async fn run_pending() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_and_get_within_ttl() {
        let cache = cache();
        cache.set(key("a"), 1);

        assert!(cache.has(&key("a")));
        assert!(matches!(cache.get(&key("a")), Some(CacheLookup::Ready(1))));
        assert!(cache.get(&key("missing")).is_none());
        assert!(cache.is_sweep_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_evicted_on_read() {
        let cache = cache();
        cache.set(key("a"), 1);

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(cache.has(&key("a")));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_remaining() {
        let cache = cache();
        cache.set(key("a"), 1);
        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(cache.ttl(&key("a")), Some(Duration::from_millis(1500)));
        assert_eq!(cache.ttl(&key("missing")), None);

        let (_tx, rx) = oneshot::channel::<u32>();
        cache.set_pending(key("pending"), rx);
        assert_eq!(cache.ttl(&key("pending")), None);

        // 过期后饱和为 0
        tokio::time::advance(Duration::from_millis(3000)).await;
        assert_eq!(cache.ttl(&key("a")), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_lookup_is_shared() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<u32>();

        let counter = calls.clone();
        cache.set_pending(key("user"), async move {
            counter.fetch_add(1, Ordering::SeqCst);
            rx.await
        });

        let first = cache.get(&key("user")).unwrap();
        let second = cache.get(&key("user")).unwrap();
        assert!(first.is_pending());
        assert!(cache.has(&key("user")));

        let waiters = tokio::spawn(async move { (first.resolve().await, second.resolve().await) });
        run_pending().await;
        tx.send(42).unwrap();

        assert_eq!(waiters.await.unwrap(), (Some(42), Some(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(cache.get(&key("user")), Some(CacheLookup::Ready(42))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_resolves_without_waiters() {
        let cache = cache();
        let (tx, rx) = oneshot::channel::<u32>();
        cache.set_pending(key("a"), rx);

        tx.send(7).unwrap();
        run_pending().await;

        assert!(matches!(cache.get(&key("a")), Some(CacheLookup::Ready(7))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_computation_caches_nothing() {
        let cache = cache();
        cache.set_pending(key("a"), async { Err::<u32, _>("boom") });

        assert_eq!(cache.resolve(&key("a")).await, None);
        assert!(cache.get(&key("a")).is_none());
        assert!(!cache.has(&key("a")));
        // 空值同样占位到过期
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ttl(&key("a")), Some(Duration::from_millis(2000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_starts_at_resolution() {
        let cache = cache();
        let (tx, rx) = oneshot::channel::<u32>();
        cache.set_pending(key("slow"), rx);

        // 超过 ttl 和清理间隔，计算仍在进行
        tokio::time::advance(Duration::from_millis(6000)).await;
        run_pending().await;
        assert!(cache.get(&key("slow")).unwrap().is_pending());

        tx.send(5).unwrap();
        run_pending().await;
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert!(matches!(cache.get(&key("slow")), Some(CacheLookup::Ready(5))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins() {
        let cache = cache();
        let (tx, rx) = oneshot::channel::<u32>();
        cache.set_pending(key("a"), rx);
        let stale = cache.get(&key("a")).unwrap();
        cache.set(key("a"), 99);

        tx.send(1).unwrap();
        // 旧计算自身的等待方仍得到它的结果
        assert_eq!(stale.resolve().await, Some(1));
        assert!(matches!(cache.get(&key("a")), Some(CacheLookup::Ready(99))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_removes_entry() {
        let cache = cache();
        cache.set(key("a"), 1);

        assert!(matches!(cache.pop(&key("a")), Some(CacheLookup::Ready(1))));
        assert!(cache.is_empty());
        assert!(cache.pop(&key("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_convenience() {
        let cache = cache();
        cache.set(key("ready"), 3);
        let (tx, rx) = oneshot::channel::<u32>();
        cache.set_pending(key("pending"), rx);
        tx.send(4).unwrap();

        assert_eq!(cache.resolve(&key("ready")).await, Some(3));
        assert_eq!(cache.resolve(&key("pending")).await, Some(4));
        assert_eq!(cache.resolve(&key("missing")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_live_entries() {
        let cache = cache();
        cache.set(key("old"), 1);
        tokio::time::advance(Duration::from_millis(1500)).await;
        cache.set(key("new"), 2);
        tokio::time::advance(Duration::from_millis(600)).await;

        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&key("new")));
        assert!(cache.is_sweep_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_and_stops() {
        let cache = cache();
        cache.set(key("a"), 1);
        cache.set(key("b"), 2);
        assert!(cache.is_sweep_running());
        // 清理任务先跑起来，定时器才以当前时间为起点
        run_pending().await;

        tokio::time::advance(Duration::from_millis(5000)).await;
        run_pending().await;

        assert!(cache.is_empty());
        assert!(!cache.is_sweep_running());

        // 再次写入时重新启动
        cache.set(key("c"), 3);
        assert!(cache.is_sweep_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_stops_sweep() {
        let cache = cache();
        cache.set(key("a"), 1);
        let (_tx, rx) = oneshot::channel::<u32>();
        cache.set_pending(key("b"), rx);

        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.is_sweep_running());
        assert!(!cache.has(&key("b")));
    }

    #[test]
    fn test_without_runtime_lazy_eviction_only() {
        let cache = cache();
        cache.set(key("a"), 1);
        assert!(!cache.is_sweep_running());
        assert!(cache.has(&key("a")));
    }
}
