//! Single integration point between the instrumentation layer and the
//! external analytics SDK.
//!
//! Everything that leaves the process goes through [`Dispatcher`]. The
//! facade never lets a sink failure escape to the instrumentation code:
//! errors are logged with context and dropped (at-most-once delivery is
//! the documented policy). Sink readiness is modelled as an explicit
//! awaitable gate instead of presence polling.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    #[error("sink rejected call: {0}")]
    Rejected(String),
    #[error("sink unavailable")]
    Unavailable,
}

/// Narrow capability interface over the remote analytics SDK.
///
/// Property objects use snake_case keys; `user_add` carries numeric-only
/// values and `user_uniq_append` list-valued ones.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track(&self, event: &str, properties: Map<String, Value>)
        -> Result<(), DispatchError>;
    async fn user_set(&self, properties: Map<String, Value>) -> Result<(), DispatchError>;
    async fn user_set_once(&self, properties: Map<String, Value>) -> Result<(), DispatchError>;
    async fn user_add(&self, properties: Map<String, Value>) -> Result<(), DispatchError>;
    async fn user_uniq_append(&self, properties: Map<String, Value>)
        -> Result<(), DispatchError>;
}

/// The dispatch facade. Cheap to clone via `Arc` construction.
pub struct Dispatcher {
    sink: Mutex<Option<Arc<dyn AnalyticsSink>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Create a facade with no sink installed yet. Calls made before
    /// [`Dispatcher::install`] are dropped with a warning.
    pub fn new() -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            sink: Mutex::new(None),
            ready_tx,
            ready_rx,
        })
    }

    /// Create a facade that is ready from the start.
    pub fn with_sink(sink: Arc<dyn AnalyticsSink>) -> Arc<Self> {
        let dispatcher = Self::new();
        dispatcher.install(sink);
        dispatcher
    }

    /// Install the concrete sink and release everything awaiting
    /// [`Dispatcher::ready`].
    pub fn install(&self, sink: Arc<dyn AnalyticsSink>) {
        *self.sink.lock() = Some(sink);
        let _ = self.ready_tx.send(true);
    }

    /// Resolve once a sink has been installed. Replaces the per-module
    /// "SDK loaded yet?" polling: dependents await this exactly once.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    fn current_sink(&self) -> Option<Arc<dyn AnalyticsSink>> {
        self.sink.lock().clone()
    }

    /// Forward a tracked event. Failures are logged, never propagated.
    pub async fn track(&self, event: &str, properties: Map<String, Value>) {
        let Some(sink) = self.current_sink() else {
            warn!(event, "dropping event: no analytics sink installed");
            return;
        };
        if let Err(err) = sink.track(event, properties).await {
            warn!(event, %err, "analytics track failed; event dropped");
        }
    }

    pub async fn user_set(&self, properties: Map<String, Value>) {
        let Some(sink) = self.current_sink() else {
            warn!("dropping user_set: no analytics sink installed");
            return;
        };
        if let Err(err) = sink.user_set(properties).await {
            warn!(%err, "user_set failed; update dropped");
        }
    }

    pub async fn user_set_once(&self, properties: Map<String, Value>) {
        let Some(sink) = self.current_sink() else {
            warn!("dropping user_set_once: no analytics sink installed");
            return;
        };
        if let Err(err) = sink.user_set_once(properties).await {
            warn!(%err, "user_set_once failed; update dropped");
        }
    }

    /// Numeric-only additive update. Non-numeric values are stripped
    /// before dispatch so a single malformed field cannot poison the call.
    pub async fn user_add(&self, properties: Map<String, Value>) {
        let numeric: Map<String, Value> = properties
            .into_iter()
            .filter(|(key, value)| {
                if value.is_number() {
                    true
                } else {
                    warn!(key = %key, "user_add value is not numeric; skipping field");
                    false
                }
            })
            .collect();
        if numeric.is_empty() {
            return;
        }
        let Some(sink) = self.current_sink() else {
            warn!("dropping user_add: no analytics sink installed");
            return;
        };
        if let Err(err) = sink.user_add(numeric).await {
            warn!(%err, "user_add failed; update dropped");
        }
    }

    pub async fn user_uniq_append(&self, properties: Map<String, Value>) {
        let Some(sink) = self.current_sink() else {
            warn!("dropping user_uniq_append: no analytics sink installed");
            return;
        };
        if let Err(err) = sink.user_uniq_append(properties).await {
            warn!(%err, "user_uniq_append failed; update dropped");
        }
    }
}

/// One captured sink call, in dispatch order.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkCall {
    Track {
        event: String,
        properties: Map<String, Value>,
    },
    UserSet(Map<String, Value>),
    UserSetOnce(Map<String, Value>),
    UserAdd(Map<String, Value>),
    UserUniqAppend(Map<String, Value>),
}

/// Test double recording every call it receives.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    pub fn tracked(&self, event: &str) -> Vec<Map<String, Value>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::Track {
                    event: name,
                    properties,
                } if name == event => Some(properties.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl AnalyticsSink for RecordingSink {
    async fn track(
        &self,
        event: &str,
        properties: Map<String, Value>,
    ) -> Result<(), DispatchError> {
        self.calls.lock().push(SinkCall::Track {
            event: event.to_string(),
            properties,
        });
        Ok(())
    }

    async fn user_set(&self, properties: Map<String, Value>) -> Result<(), DispatchError> {
        self.calls.lock().push(SinkCall::UserSet(properties));
        Ok(())
    }

    async fn user_set_once(&self, properties: Map<String, Value>) -> Result<(), DispatchError> {
        self.calls.lock().push(SinkCall::UserSetOnce(properties));
        Ok(())
    }

    async fn user_add(&self, properties: Map<String, Value>) -> Result<(), DispatchError> {
        self.calls.lock().push(SinkCall::UserAdd(properties));
        Ok(())
    }

    async fn user_uniq_append(
        &self,
        properties: Map<String, Value>,
    ) -> Result<(), DispatchError> {
        self.calls.lock().push(SinkCall::UserUniqAppend(properties));
        Ok(())
    }
}

/// Sink that drops everything. Useful when a tracker module is disabled.
pub struct NoopSink;

impl NoopSink {
    pub fn new() -> Arc<dyn AnalyticsSink> {
        Arc::new(Self)
    }
}

#[async_trait]
impl AnalyticsSink for NoopSink {
    async fn track(&self, _: &str, _: Map<String, Value>) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn user_set(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn user_set_once(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn user_add(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn user_uniq_append(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Sink that fails every call; exercises the swallow-and-continue path.
pub struct FailingSink;

impl FailingSink {
    pub fn new() -> Arc<dyn AnalyticsSink> {
        Arc::new(Self)
    }
}

#[async_trait]
impl AnalyticsSink for FailingSink {
    async fn track(&self, _: &str, _: Map<String, Value>) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected("forced failure".into()))
    }

    async fn user_set(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected("forced failure".into()))
    }

    async fn user_set_once(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected("forced failure".into()))
    }

    async fn user_add(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected("forced failure".into()))
    }

    async fn user_uniq_append(&self, _: Map<String, Value>) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected("forced failure".into()))
    }
}

/// Build a property map from `(key, value)` pairs. Keeps call sites terse.
pub fn props(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
