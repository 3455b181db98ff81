use anyhow::Result;
use clap::ArgMatches;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use poolwarden::db::PROBE_QUERY;
use poolwarden::{Config, PoolManager};

pub async fn handle_watch(matches: &ArgMatches, config: &Config) -> Result<()> {
    let interval = Duration::from_secs(matches.get_one::<u64>("interval").copied().unwrap_or(30));

    let manager = PoolManager::from_config(config);
    watch_until(&manager, interval, tokio::signal::ctrl_c()).await;

    manager.shutdown().await;
    Ok(())
}

/// Report on every tick until `shutdown` resolves, even mid-acquisition.
async fn watch_until<F: Future>(manager: &PoolManager, interval: Duration, shutdown: F) {
    let mut ticker = tokio::time::interval(interval);
    tokio::pin!(shutdown);

    info!(interval_secs = interval.as_secs(), "Watching database pool");

    loop {
        let stop = tokio::select! {
            _ = &mut shutdown => true,
            _ = ticker.tick() => tokio::select! {
                _ = &mut shutdown => true,
                _ = report_once(manager) => false,
            },
        };

        if stop {
            info!("Received shutdown signal");
            break;
        }
    }
}

/// One health report. An invalidated pool is rebuilt by the acquisition here.
async fn report_once(manager: &PoolManager) {
    let pool = match manager.acquire().await {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "Database pool unavailable; retrying on next tick");
            return;
        }
    };

    let query_ok = match pool.get_connection().await {
        Ok(conn) => match conn.simple_query(PROBE_QUERY).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Health query failed");
                false
            }
        },
        Err(e) => {
            warn!(error = %e, "Could not check out a connection");
            false
        }
    };

    let stats = pool.stats();
    info!(
        healthy = query_ok,
        size = stats.size,
        idle = stats.idle_connections,
        active = stats.active_connections,
        max = stats.max_size,
        utilization = %format!("{:.1}%", stats.utilization_percent()),
        invalidations = manager.invalidation_count(),
        "Database pool status"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolwarden::{DatabaseConfig, PgBackend, PoolConfig};

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_acquisition() {
        // Nothing listens on port 1, so every probe is refused and retried
        let database = DatabaseConfig {
            url: Some("postgres://app:pw@127.0.0.1:1/community".to_string()),
            ..DatabaseConfig::default()
        };
        let pool = PoolConfig {
            max_retries: 5,
            retry_delay_ms: 60_000,
            connection_timeout_ms: 500,
            ..PoolConfig::default()
        };
        let manager = PoolManager::new(PgBackend::new(database), pool);

        let started = std::time::Instant::now();
        let watched = tokio::time::timeout(
            Duration::from_secs(5),
            watch_until(&manager, Duration::from_secs(1), tokio::time::sleep(Duration::from_millis(100))),
        )
        .await;
        assert!(watched.is_ok(), "watch loop ignored the shutdown signal");

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .expect("shutdown waited out the retry delay");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!manager.is_cached());
    }
}
