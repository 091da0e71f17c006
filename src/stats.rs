//! Refresh state statistics.
//!
//! Provides a quick summary of the catalog: how many entities are tracked,
//! how many have been processed, which carry errors and what is waiting to
//! be processed. Used by `catalog stats`.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store::{StateStore, StoreOptions};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = StateStore::new(pool.clone(), StoreOptions::from_config(&config.processing));

    let stats = {
        let mut conn = pool.acquire().await?;
        store.stats(&mut conn).await?
    };

    let stitched: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM final_entities")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Catalog Refresh: Database Stats");
    println!("===============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Entities:    {}", stats.entities);
    println!(
        "  Processed:   {} / {} ({}%)",
        stats.processed,
        stats.entities,
        percent(stats.processed, stats.entities)
    );
    println!("  Stitched:    {}", stitched);
    println!("  With errors: {}", stats.with_errors);
    println!("  Due now:     {}", stats.due);
    println!();
    println!("  References:  {}", stats.references);
    println!("  Relations:   {}", stats.relations);
    println!();

    pool.close().await;
    Ok(())
}

fn percent(part: i64, total: i64) -> i64 {
    if total > 0 {
        (part * 100) / total
    } else {
        0
    }
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
