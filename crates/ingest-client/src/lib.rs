//! Buffering client for the ThinkingData-compatible ingestion endpoint.
//!
//! Events accumulate in an in-memory buffer and are POSTed as a JSON array
//! of `{appid, data, debug}` envelopes once the batch size is reached or
//! `flush` is called. A response is a success iff it is HTTP 2xx and the
//! body parses with `code == 0`; everything else surfaces as an error to
//! the caller (the batch reporting path propagates it, the browser-side
//! dispatch facade swallows it).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use pagepulse_core_types::{format_event_time, Clock, SystemClock};
use pagepulse_dispatch::{AnalyticsSink, DispatchError};

#[derive(Clone, Debug, Error)]
pub enum IngestError {
    #[error("ingest request failed: {0}")]
    Transport(String),
    #[error("ingest endpoint returned HTTP {0}")]
    HttpStatus(u16),
    #[error("ingest endpoint rejected batch: code={code} msg={msg}")]
    Rejected { code: i64, msg: String },
    #[error("ingest response body unparseable: {0}")]
    BadResponse(String),
}

impl From<IngestError> for DispatchError {
    fn from(value: IngestError) -> Self {
        DispatchError::Rejected(value.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    pub server_url: String,
    pub endpoint_path: String,
    pub app_id: String,
    /// Distinct id attached to every payload (visitor scope).
    pub distinct_id: String,
    /// Buffered envelopes before an automatic flush.
    pub batch_size: usize,
    pub debug_mode: bool,
    pub timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            server_url: "https://receiver.thinkingdata.example".to_string(),
            endpoint_path: "/sync_json".to_string(),
            app_id: String::new(),
            distinct_id: String::new(),
            batch_size: 20,
            debug_mode: false,
            timeout_ms: 10_000,
        }
    }
}

/// One wire envelope. `debug` is the endpoint's 0/1 flag, not a boolean.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub appid: String,
    pub data: Value,
    pub debug: u8,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
}

pub struct IngestClient {
    http: Client,
    config: IngestConfig,
    clock: Arc<dyn Clock>,
    buffer: Mutex<Vec<Envelope>>,
}

impl IngestClient {
    pub fn new(config: IngestConfig) -> Result<Arc<Self>, IngestError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: IngestConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>, IngestError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| IngestError::Transport(err.to_string()))?;
        Ok(Arc::new(Self {
            http,
            config,
            clock,
            buffer: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Buffer a tracked event; flushes automatically when the batch is
    /// full.
    pub async fn track(
        &self,
        event: &str,
        properties: Map<String, Value>,
    ) -> Result<(), IngestError> {
        let data = self.data_object("track", Some(event), properties);
        self.push(data).await
    }

    pub async fn user_op(
        &self,
        op: &str,
        properties: Map<String, Value>,
    ) -> Result<(), IngestError> {
        let data = self.data_object(op, None, properties);
        self.push(data).await
    }

    fn data_object(
        &self,
        kind: &str,
        event: Option<&str>,
        properties: Map<String, Value>,
    ) -> Value {
        let mut data = Map::new();
        data.insert("#type".into(), json!(kind));
        if let Some(event) = event {
            data.insert("#event_name".into(), json!(event));
        }
        data.insert(
            "#time".into(),
            json!(format_event_time(self.clock.now_ms())),
        );
        data.insert("#distinct_id".into(), json!(self.config.distinct_id));
        data.insert("properties".into(), Value::Object(properties));
        Value::Object(data)
    }

    async fn push(&self, data: Value) -> Result<(), IngestError> {
        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(Envelope {
                appid: self.config.app_id.clone(),
                data,
                debug: u8::from(self.config.debug_mode),
            });
            buffer.len() >= self.config.batch_size.max(1)
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send everything buffered. The buffer is drained before the request
    /// goes out; a failed batch is reported, not requeued.
    pub async fn flush(&self) -> Result<(), IngestError> {
        let batch: Vec<Envelope> = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}{}",
            self.config.server_url.trim_end_matches('/'),
            self.config.endpoint_path
        );
        debug!(count = batch.len(), %url, "flushing ingest batch");

        let response = self
            .http
            .post(&url)
            .json(&batch)
            .send()
            .await
            .map_err(|err| IngestError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "ingest endpoint returned non-2xx");
            return Err(IngestError::HttpStatus(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| IngestError::BadResponse(err.to_string()))?;
        let parsed: ApiResponse =
            serde_json::from_str(&body).map_err(|err| IngestError::BadResponse(err.to_string()))?;
        if parsed.code != 0 {
            return Err(IngestError::Rejected {
                code: parsed.code,
                msg: parsed.msg.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// The ingest client doubles as the concrete analytics sink behind the
/// dispatch facade: the facade decides swallow-vs-propagate, the client
/// only reports.
#[async_trait]
impl AnalyticsSink for IngestClient {
    async fn track(
        &self,
        event: &str,
        properties: Map<String, Value>,
    ) -> Result<(), DispatchError> {
        IngestClient::track(self, event, properties)
            .await
            .map_err(Into::into)
    }

    async fn user_set(&self, properties: Map<String, Value>) -> Result<(), DispatchError> {
        self.user_op("user_set", properties).await.map_err(Into::into)
    }

    async fn user_set_once(&self, properties: Map<String, Value>) -> Result<(), DispatchError> {
        self.user_op("user_setOnce", properties)
            .await
            .map_err(Into::into)
    }

    async fn user_add(&self, properties: Map<String, Value>) -> Result<(), DispatchError> {
        self.user_op("user_add", properties).await.map_err(Into::into)
    }

    async fn user_uniq_append(
        &self,
        properties: Map<String, Value>,
    ) -> Result<(), DispatchError> {
        self.user_op("user_uniq_append", properties)
            .await
            .map_err(Into::into)
    }
}
