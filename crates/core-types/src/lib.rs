//! Shared primitives used across the PagePulse crates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone};
use thiserror::Error;

/// Shared error type carried across crate boundaries when a richer
/// per-crate error enum is not warranted.
#[derive(Debug, Error, Clone)]
pub enum PulseError {
    #[error("{message}")]
    Message { message: String },
}

impl PulseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

/// Identifier for one browsing session. Epoch milliseconds at allocation
/// combined with a process-monotonic counter, so timeout-triggered
/// immediate restarts never reuse an id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub u64);

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

impl SessionId {
    /// Allocate a fresh id. The low ten bits hold the sequence counter;
    /// wall-clock millis occupy the rest.
    pub fn allocate(now_ms: u64) -> Self {
        let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed) & 0x3ff;
        Self((now_ms << 10) | seq)
    }

    /// Millisecond timestamp the id was derived from.
    pub fn created_ms(&self) -> u64 {
        self.0 >> 10
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a visitor (one browser storage scope, not a human).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct VisitorId(pub String);

impl VisitorId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for VisitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clock abstraction so the session and attribute engines can be driven by
/// a fake in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock backed implementation used in production wiring.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Format a millisecond timestamp in the fixed wire format expected by the
/// ingestion endpoint: `YYYY-MM-DD HH:mm:ss.SSS`, local time, no timezone
/// suffix.
pub fn format_event_time(ms: u64) -> String {
    match Local.timestamp_millis_opt(ms as i64) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        }
        chrono::LocalResult::None => String::new(),
    }
}
