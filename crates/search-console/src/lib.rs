//! Search Console performance reporting.
//!
//! `SearchConsoleClient` pulls paginated rows from the
//! `searchAnalytics/query` endpoint; `ReportingBridge` replays them as
//! `gsc_performance` events through the buffering ingest client. Unlike
//! the browser-side dispatch facade, failures here propagate to the
//! caller so the batch process can exit non-zero.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use pagepulse_ingest_client::{IngestClient, IngestError};

#[derive(Debug, Error)]
pub enum SearchConsoleError {
    #[error("search console request failed: {0}")]
    Transport(String),
    #[error("search console returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("search console response unparseable: {0}")]
    BadResponse(String),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConsoleConfig {
    /// Property as registered in Search Console, e.g. `sc-domain:example.com`
    /// or `https://example.com/`.
    pub site_url: String,
    pub api_base: String,
    pub access_token: String,
    pub dimensions: Vec<String>,
    /// Rows per page; pagination stops at the first short page.
    pub row_limit: u32,
    pub timeout_ms: u64,
}

impl Default for SearchConsoleConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            api_base: "https://www.googleapis.com/webmasters/v3".to_string(),
            access_token: String::new(),
            dimensions: vec!["query".to_string(), "page".to_string()],
            row_limit: 1000,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    start_date: String,
    end_date: String,
    dimensions: &'a [String],
    row_limit: u32,
    start_row: u32,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<PerformanceRow>,
}

/// One aggregated row from the performance report. `keys` line up with
/// the requested dimensions, in order.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PerformanceRow {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub clicks: f64,
    #[serde(default)]
    pub impressions: f64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub position: f64,
}

pub struct SearchConsoleClient {
    http: Client,
    config: SearchConsoleConfig,
}

impl SearchConsoleClient {
    pub fn new(config: SearchConsoleConfig) -> Result<Self, SearchConsoleError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| SearchConsoleError::Transport(err.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &SearchConsoleConfig {
        &self.config
    }

    fn query_url(&self) -> String {
        format!(
            "{}/sites/{}/searchAnalytics/query",
            self.config.api_base.trim_end_matches('/'),
            encode_site(&self.config.site_url)
        )
    }

    async fn query_page(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        start_row: u32,
    ) -> Result<Vec<PerformanceRow>, SearchConsoleError> {
        let request = QueryRequest {
            start_date: start_date.format("%Y-%m-%d").to_string(),
            end_date: end_date.format("%Y-%m-%d").to_string(),
            dimensions: &self.config.dimensions,
            row_limit: self.config.row_limit,
            start_row,
        };
        debug!(start_row, url = %self.query_url(), "querying search analytics page");

        let response = self
            .http
            .post(self.query_url())
            .bearer_auth(&self.config.access_token)
            .json(&request)
            .send()
            .await
            .map_err(|err| SearchConsoleError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "search console rejected query");
            return Err(SearchConsoleError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|err| SearchConsoleError::BadResponse(err.to_string()))?;
        Ok(parsed.rows)
    }

    /// Fetch every row for the date range, paging with `start_row` until
    /// the endpoint returns a short page.
    pub async fn query_all(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<PerformanceRow>, SearchConsoleError> {
        let mut rows = Vec::new();
        let mut start_row = 0u32;
        loop {
            let page = self.query_page(start_date, end_date, start_row).await?;
            let page_len = page.len();
            rows.extend(page);
            if page_len < self.config.row_limit as usize {
                break;
            }
            start_row += self.config.row_limit;
        }
        Ok(rows)
    }
}

/// Replays report rows as analytics events. Rows are tracked one at a
/// time so the ingest client's batch trigger fires at its own cadence;
/// the trailing partial batch is flushed explicitly.
pub struct ReportingBridge {
    client: SearchConsoleClient,
    ingest: Arc<IngestClient>,
}

impl ReportingBridge {
    pub fn new(client: SearchConsoleClient, ingest: Arc<IngestClient>) -> Self {
        Self { client, ingest }
    }

    pub async fn collect_daily(&self, date: NaiveDate) -> Result<usize, SearchConsoleError> {
        self.collect_range(date, date).await
    }

    pub async fn collect_range(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<usize, SearchConsoleError> {
        let rows = self.client.query_all(start_date, end_date).await?;
        info!(
            rows = rows.len(),
            %start_date,
            %end_date,
            "replaying search console rows"
        );
        for row in &rows {
            let props = row_properties(
                row,
                &self.client.config.dimensions,
                &self.client.config.site_url,
                start_date,
                end_date,
            );
            self.ingest.track("gsc_performance", props).await?;
        }
        self.ingest.flush().await?;
        Ok(rows.len())
    }
}

/// Flatten a row into event properties: each dimension key lands under
/// its dimension name, metrics keep their API names.
pub fn row_properties(
    row: &PerformanceRow,
    dimensions: &[String],
    site_url: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Map<String, Value> {
    let mut props = Map::new();
    props.insert("site".into(), json!(site_url));
    props.insert(
        "start_date".into(),
        json!(start_date.format("%Y-%m-%d").to_string()),
    );
    props.insert(
        "end_date".into(),
        json!(end_date.format("%Y-%m-%d").to_string()),
    );
    for (dimension, key) in dimensions.iter().zip(&row.keys) {
        props.insert(dimension.clone(), json!(key));
    }
    props.insert("clicks".into(), json!(row.clicks));
    props.insert("impressions".into(), json!(row.impressions));
    props.insert("ctr".into(), json!(row.ctr));
    props.insert("position".into(), json!(row.position));
    props
}

/// Search Console site identifiers are path segments: `:` and `/` must
/// be percent-encoded, nothing else in a valid property needs it.
fn encode_site(site_url: &str) -> String {
    site_url.replace(':', "%3A").replace('/', "%2F")
}
