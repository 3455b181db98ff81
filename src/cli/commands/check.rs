use anyhow::{bail, Result};
use clap::ArgMatches;
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::cli::utils::{format_duration, pluralize};
use poolwarden::{Config, PoolError, PoolManager, PoolStats};

#[derive(Debug, Serialize)]
struct CheckReport {
    healthy: bool,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<PoolStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retries: Option<u32>,
}

pub async fn handle_check(matches: &ArgMatches, config: &Config) -> Result<()> {
    let json = matches.get_one::<String>("format").map(String::as_str) == Some("json");

    let manager = PoolManager::from_config(config);
    let started = Instant::now();
    let result = manager.acquire().await;
    let elapsed = started.elapsed();

    let report = match &result {
        Ok(pool) => CheckReport {
            healthy: true,
            elapsed_ms: elapsed.as_millis(),
            stats: Some(pool.stats()),
            error: None,
            code: None,
            retries: None,
        },
        Err(e) => CheckReport {
            healthy: false,
            elapsed_ms: elapsed.as_millis(),
            stats: None,
            error: Some(e.to_string()),
            code: e.db_error().and_then(|db| db.code()).map(str::to_string),
            retries: match e {
                PoolError::Connection { attempts, .. } => Some(*attempts),
                _ => None,
            },
        },
    };

    manager.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, elapsed, config);
    }

    if !report.healthy {
        bail!("database pool check failed");
    }
    Ok(())
}

fn print_report(report: &CheckReport, elapsed: Duration, config: &Config) {
    println!("Database pool check");
    println!("===================");
    println!(
        "  target: {}",
        config.database.redacted_url().as_deref().unwrap_or("<DATABASE_URL not set>")
    );
    println!("  tls: {}", if config.database.tls_enabled() { "required" } else { "disabled" });
    println!("  elapsed: {}", format_duration(elapsed));

    if let Some(stats) = &report.stats {
        println!(
            "  ✅ healthy: {} open, {} idle, max {}",
            pluralize("connection", stats.size),
            stats.idle_connections,
            stats.max_size
        );
    }

    if let Some(error) = &report.error {
        println!("  ❌ {}", error);
        if let Some(code) = &report.code {
            println!("    code: {}", code);
        }
        if let Some(retries) = report.retries {
            println!("    retries: {}/{}", retries, config.pool.max_retries);
        }
    }
}
