use anyhow::{bail, Context, Result};
use chrono::{Days, Local, NaiveDate};
use clap::Args;
use tracing::info;

use pagepulse_ingest_client::{IngestClient, IngestConfig};
use pagepulse_search_console::{ReportingBridge, SearchConsoleClient, SearchConsoleConfig};

use crate::config::Config;

#[derive(Args, Clone, Debug)]
pub struct CollectArgs {
    /// Collection mode
    #[arg(long, value_enum, default_value_t = CollectMode::Daily)]
    pub mode: CollectMode,

    /// Days behind today the daily report targets (defaults to the
    /// configured API lag)
    #[arg(long)]
    pub days: Option<u32>,

    /// Range start (YYYY-MM-DD), `all` mode only
    #[arg(long)]
    pub start_date: Option<NaiveDate>,

    /// Range end (YYYY-MM-DD), `all` mode only
    #[arg(long)]
    pub end_date: Option<NaiveDate>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum CollectMode {
    /// One lagged day
    Daily,
    /// An explicit or default date range
    All,
}

pub async fn cmd_collect(args: CollectArgs, config: &Config) -> Result<()> {
    if config.search_console.site_url.is_empty() {
        bail!("search_console.site_url is not configured");
    }
    if config.search_console.access_token.is_empty() {
        bail!("no Search Console access token (set PAGEPULSE_GSC_TOKEN)");
    }
    if config.thinking_data.app_id.is_empty() {
        bail!("thinking_data.app_id is not configured");
    }

    let ingest = IngestClient::new(IngestConfig {
        server_url: config.thinking_data.server_url.clone(),
        endpoint_path: config.thinking_data.endpoint_path.clone(),
        app_id: config.thinking_data.app_id.clone(),
        distinct_id: "search_console_bridge".to_string(),
        batch_size: config.thinking_data.batch_size,
        debug_mode: config.debug,
        timeout_ms: config.thinking_data.timeout_ms,
    })?;
    let client = SearchConsoleClient::new(SearchConsoleConfig {
        site_url: config.search_console.site_url.clone(),
        api_base: config.search_console.api_base.clone(),
        access_token: config.search_console.access_token.clone(),
        dimensions: config.search_console.dimensions.clone(),
        row_limit: config.search_console.row_limit,
        timeout_ms: config.search_console.timeout_ms,
    })?;
    let bridge = ReportingBridge::new(client, ingest);

    let today = Local::now().date_naive();
    let lag = Days::new(u64::from(args.days.unwrap_or(config.search_console.lag_days)));
    let latest = today
        .checked_sub_days(lag)
        .context("lag underflows the calendar")?;

    let replayed = match args.mode {
        CollectMode::Daily => {
            info!(date = %latest, "collecting daily search performance");
            bridge.collect_daily(latest).await?
        }
        CollectMode::All => {
            let end = args.end_date.unwrap_or(latest);
            let start = args.start_date.unwrap_or_else(|| {
                end.checked_sub_days(Days::new(27)).unwrap_or(end)
            });
            if start > end {
                bail!("start date {start} is after end date {end}");
            }
            info!(%start, %end, "collecting search performance range");
            bridge.collect_range(start, end).await?
        }
    };

    println!("Replayed {replayed} search performance rows");
    Ok(())
}
