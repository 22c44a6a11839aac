use std::sync::Arc;

use anyhow::Result;

use pagepulse_kv_store::{JsonFileStore, KvBackend, KvExt, MemoryStore};
use pagepulse_session_center::SessionStats;

use crate::config::Config;

pub async fn cmd_info(config: &Config) -> Result<()> {
    println!("PagePulse System Information");
    println!("============================");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("Configuration:");
    println!(
        "- Ingestion endpoint: {}{}",
        config.thinking_data.server_url, config.thinking_data.endpoint_path
    );
    println!(
        "- App id: {}",
        if config.thinking_data.app_id.is_empty() {
            "(unset)"
        } else {
            config.thinking_data.app_id.as_str()
        }
    );
    println!("- Auto track: {}", config.thinking_data.auto_track);
    println!(
        "- Session timeout: {}s (engagement: {}s or {} interactions)",
        config.session.timeout_ms / 1000,
        config.session.engagement_time_ms / 1000,
        config.session.engagement_interactions
    );
    let modules = &config.modules;
    let enabled: Vec<&str> = [
        ("click", modules.click),
        ("scroll", modules.scroll),
        ("form", modules.form),
        ("popup", modules.popup),
        ("resource", modules.resource),
        ("video", modules.video),
        ("page_view", modules.page_view),
        ("exit", modules.exit),
    ]
    .into_iter()
    .filter_map(|(name, on)| on.then_some(name))
    .collect();
    println!("- Enabled trackers: {}", enabled.join(", "));
    println!(
        "- Search Console site: {}",
        if config.search_console.site_url.is_empty() {
            "(unset)"
        } else {
            config.search_console.site_url.as_str()
        }
    );

    println!();
    println!("Stored visitor state:");
    let store: Arc<dyn KvBackend> = match &config.storage.path {
        Some(path) => {
            println!("- Storage: {}", path.display());
            Arc::new(JsonFileStore::open(path))
        }
        None => {
            println!("- Storage: in-memory (empty each run)");
            Arc::new(MemoryStore::new())
        }
    };
    match store.get("visitor_id") {
        Some(visitor) => println!("- Visitor id: {visitor}"),
        None => println!("- Visitor id: (none yet)"),
    }
    match store.get_json::<SessionStats>("session_stats") {
        Some(stats) => {
            println!("- Sessions recorded: {}", stats.count);
            println!("- Engaged sessions: {}", stats.engaged_count);
            println!(
                "- Session duration: avg {}ms, max {}ms",
                stats.avg_duration_ms, stats.max_duration_ms
            );
        }
        None => println!("- Sessions recorded: 0"),
    }

    Ok(())
}
