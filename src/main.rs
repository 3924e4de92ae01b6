use appmon_core::{
    config::LogConfig, logging, AppConfig, AppState, AppStateChannel, CacheLookup,
    ExpiringAsyncCache, MonotonicClock, StallTracker,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 阻塞当前线程，模拟事件循环上的同步重活
fn block_event_loop(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

async fn run_stall_demo(config: &AppConfig) -> anyhow::Result<()> {
    let app_state = Arc::new(AppStateChannel::new(AppState::Active));
    let tracker = StallTracker::with_parts(
        config.stall.to_tracker_config(),
        Arc::new(MonotonicClock::new()),
        Some(app_state.clone()),
    );

    let span_id = uuid::Uuid::new_v4().to_string();
    let finisher = tracker.register_span_start(&span_id);
    info!("span {} 开始", span_id);

    tokio::time::sleep(Duration::from_millis(50)).await;
    block_event_loop(300);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 后台期间的阻塞不计入卡顿
    app_state.set(AppState::Background);
    tokio::time::sleep(Duration::from_millis(5)).await;
    block_event_loop(500);
    app_state.set(AppState::Active);
    tokio::time::sleep(Duration::from_millis(50)).await;

    match finisher.finish(None) {
        Some(measurements) => {
            info!(
                "span {} 结束: 卡顿 {} 次, 共 {:.1}ms, 最长 {:.1}ms",
                span_id,
                measurements.count(),
                measurements.total_time_ms(),
                measurements.longest_time_ms()
            );
            info!(
                "measurements = {}",
                serde_json::to_string_pretty(&measurements)?
            );
        }
        None => warn!("span {} 没有卡顿度量", span_id),
    }

    info!("全局统计: {:?}", tracker.stats());
    Ok(())
}

async fn run_cache_demo(config: &AppConfig) -> anyhow::Result<()> {
    let cache: ExpiringAsyncCache<String, String> =
        ExpiringAsyncCache::new(config.cache.to_expiring_cache_config());

    let key = "user:1".to_string();
    cache.set_pending(key.clone(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, anyhow::Error>("alice".to_string())
    });

    // 计算完成前的查询共享同一个结果
    let lookups: Vec<CacheLookup<String>> = (0..3).filter_map(|_| cache.get(&key)).collect();
    info!(
        "{} 个查询命中进行中的计算: {}",
        lookups.len(),
        lookups.iter().all(|lookup| lookup.is_pending())
    );
    let results = futures::future::join_all(lookups.into_iter().map(CacheLookup::resolve)).await;
    info!("查询结果: {:?}", results);

    cache.set_pending("user:2".to_string(), async {
        Err::<String, _>(anyhow::anyhow!("用户不存在"))
    });
    let missing = cache.resolve(&"user:2".to_string()).await;
    info!("失败的计算: {:?}, has={}", missing, cache.has(&"user:2".to_string()));

    info!("{} 剩余存活时间: {:?}", key, cache.ttl(&key));
    cache.clear();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 🔥 先加载配置，日志系统依赖其中的 [log] 段
    let loaded = AppConfig::load_from_file(CONFIG_PATH).await;
    let log_config = loaded
        .as_ref()
        .map(|config| config.log.clone())
        .unwrap_or_else(|_| LogConfig::default());

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("appmon-demo v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(config) => {
            info!("配置文件加载成功: {}", CONFIG_PATH);
            config
        }
        Err(e) => {
            warn!("配置文件加载失败，使用默认配置: {:#}", e);
            AppConfig::default()
        }
    };

    run_stall_demo(&config).await?;
    run_cache_demo(&config).await?;

    info!("✓ 演示结束");
    Ok(())
}
