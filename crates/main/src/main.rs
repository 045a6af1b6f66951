//! 主应用程序入口
//!
//! 构造进程级单例，启动 Hub 事件循环和定时刷盘任务，收到停机信号后做最后一次刷盘。
//! 传输层（WebSocket）和认证是外部组件：它们用 `HubHandle` 和自己构造的
//! `ConnectionGate` 接入，本进程不打开任何监听端口。

use std::sync::Arc;

use application::{
    CacheSettings, Clock, Hub, HubDependencies, MessageCache, RateLimiter, SystemClock,
};
use config::AppConfig;
use infrastructure::Infrastructure;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    info!(config = %config.sanitize(), "启动聊天核心服务");

    let infra = Infrastructure::connect(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let rate_limit = infra.initial_rate_limit(&config).await;
    let rate_limiter = Arc::new(RateLimiter::new(infra.rate_counter.clone(), rate_limit));

    let cache = Arc::new(MessageCache::new(
        infra.cache_store.clone(),
        infra.storage.clone(),
        rate_limiter,
        CacheSettings::from_config(&config.cache),
    ));

    let (hub, handle) = Hub::new(
        HubDependencies {
            cache: cache.clone(),
            session_records: infra.storage.clone(),
            clock,
            observer_applications: config.hub.observer_applications.clone(),
        },
        config.hub.command_capacity,
    );

    let shutdown = CancellationToken::new();
    let hub_task = hub.spawn(shutdown.clone());
    let flush_task = cache.spawn_periodic_flush(shutdown.clone());
    info!(
        flush_interval_secs = config.cache.flush_interval_secs,
        "hub and periodic flush started"
    );

    wait_for_shutdown().await?;
    match handle.connected_users().await {
        Ok(users) => info!(online = users.len(), "停机前的在线用户数"),
        Err(err) => warn!(error = %err, "hub 已停止，无法统计在线用户"),
    }
    shutdown.cancel();

    hub_task.await?;
    flush_task.await?;

    let reports = cache.flush_all().await;
    for report in reports {
        info!(
            class = %report.class,
            inserted = report.inserted,
            "final flush complete"
        );
    }
    info!("聊天核心服务已停止");
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut sig_term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("接收到 Ctrl+C 信号，开始优雅停机...");
            }
            _ = sig_term.recv() => {
                info!("接收到终止信号，开始优雅停机...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("接收到 Ctrl+C 信号，开始优雅停机...");
    }
    Ok(())
}
