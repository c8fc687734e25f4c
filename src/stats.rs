//! Database statistics and health overview.
//!
//! Quick summary of what's seeded: passage counts, rule coverage, cached
//! evidence, and per-case breakdowns. Used by `evh stats` to give
//! confidence that case bundles landed as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-case breakdown of passage and rule counts.
struct CaseStats {
    case_id: String,
    passage_count: i64,
    section_count: i64,
    rule_count: i64,
    last_rule_ts: Option<i64>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_passages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages")
        .fetch_one(&pool)
        .await?;

    let distinct_rules: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT id) FROM rules")
        .fetch_one(&pool)
        .await?;

    let rule_versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rules")
        .fetch_one(&pool)
        .await?;

    let cached_articles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM evidence_cache")
        .fetch_one(&pool)
        .await?;

    let cached_queries: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT query_key) FROM evidence_cache")
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Evidence Harness — Database Stats");
    println!("=================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Passages:    {}", total_passages);
    println!(
        "  Rules:       {} ({} versions)",
        distinct_rules, rule_versions
    );
    println!(
        "  Evidence:    {} cached articles across {} queries",
        cached_articles, cached_queries
    );

    // Passages and rules are independent tables, so merge the two
    // groupings on case id; rule-only cases (the shared dosing defaults)
    // still get a row.
    let passage_rows = sqlx::query(
        r#"
        SELECT
            case_id,
            COUNT(*) AS passage_count,
            COUNT(DISTINCT section) AS section_count
        FROM passages
        GROUP BY case_id
        ORDER BY passage_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let rule_rows = sqlx::query(
        r#"
        SELECT
            case_id,
            COUNT(DISTINCT id) AS rule_count,
            MAX(updated_at) AS last_updated
        FROM rules
        GROUP BY case_id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut case_stats: Vec<CaseStats> = Vec::new();
    for row in &passage_rows {
        let case_id: String = row.get("case_id");
        let rule_row = rule_rows.iter().find(|r| {
            let rule_case: String = r.get("case_id");
            rule_case == case_id
        });

        case_stats.push(CaseStats {
            case_id,
            passage_count: row.get("passage_count"),
            section_count: row.get("section_count"),
            rule_count: rule_row.map(|r| r.get("rule_count")).unwrap_or(0),
            last_rule_ts: rule_row.map(|r| r.get::<i64, _>("last_updated")),
        });
    }
    for row in &rule_rows {
        let case_id: String = row.get("case_id");
        if case_stats.iter().any(|c| c.case_id == case_id) {
            continue;
        }
        case_stats.push(CaseStats {
            case_id,
            passage_count: 0,
            section_count: 0,
            rule_count: row.get("rule_count"),
            last_rule_ts: Some(row.get("last_updated")),
        });
    }

    if !case_stats.is_empty() {
        println!();
        println!("  By case:");
        println!(
            "  {:<24} {:>8} {:>8} {:>6}   {}",
            "CASE", "PASSAGES", "SECTIONS", "RULES", "LAST RULE UPDATE"
        );
        println!("  {}", "-".repeat(72));

        for c in &case_stats {
            let updated_display = match c.last_rule_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>8} {:>6}   {}",
                c.case_id, c.passage_count, c.section_count, c.rule_count, updated_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
