use anyhow::Result;
use serde_json::json;

use crate::cli::utils::format_duration;
use poolwarden::Config;

pub fn handle_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    shown.database.url = config.database.redacted_url();

    let output = json!({
        "config": shown,
        "tls_enabled": config.database.tls_enabled(),
        "worst_case_establish_time": format_duration(config.pool.worst_case_establish_time()),
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
