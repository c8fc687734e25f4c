//! Operator cache management.
//!
//! The session cache lives inside the serving process, so these commands
//! go through the server's HTTP surface instead of the database.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::models::CacheStats;

fn base_url(config: &Config) -> String {
    format!("http://{}", config.server.bind)
}

pub async fn run_cache_stats(config: &Config) -> Result<()> {
    let url = format!("{}/v1/cache/stats", base_url(config));
    let stats: CacheStats = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("reach {} (is the server running?)", url))?
        .error_for_status()?
        .json()
        .await?;

    println!("entries:  {}", stats.total_entries);
    println!("sessions: {}", stats.total_sessions);
    match stats.oldest_entry {
        Some(ts) => match chrono::DateTime::from_timestamp(ts, 0) {
            Some(dt) => println!("oldest:   {}", dt.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("oldest:   {}", ts),
        },
        None => println!("oldest:   -"),
    }
    Ok(())
}

pub async fn run_cache_clear(config: &Config, session: Option<String>) -> Result<()> {
    let url = format!("{}/v1/cache/clear", base_url(config));
    let body = match &session {
        Some(session_id) => serde_json::json!({ "sessionId": session_id }),
        None => serde_json::json!({}),
    };

    let response: serde_json::Value = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("reach {} (is the server running?)", url))?
        .error_for_status()?
        .json()
        .await?;

    let cleared = response
        .get("cleared")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    match session {
        Some(session_id) => println!("cleared {} entries for session {}", cleared, session_id),
        None => println!("cleared {} entries", cleared),
    }
    Ok(())
}
