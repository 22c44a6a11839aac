//! Normalized page interaction records and the broadcast bus that fans
//! them out to the trackers.
//!
//! The embedding host (webview bridge, replay log, test harness) produces
//! `PageEvent` values; trackers subscribe and classify. The bus never
//! blocks a publisher: a slow subscriber lags and drops, which matches
//! the instrumentation rule that collection must not interfere with the
//! page.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use pagepulse_core_types::PulseError;

/// Why the page is going away. Back/forward-cache restores arrive as
/// their own event and are ignored by the exit tracker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Unload,
    PageHide,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoAction {
    Play,
    Pause,
    Progress,
    Complete,
}

/// One normalized interaction, as produced by the host. Field accessors
/// on the raw DOM happen host-side; by the time a record is on the bus
/// every field is already a safe default if the source was missing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageEventKind {
    PageView {
        #[serde(default)]
        url: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        referrer: String,
        #[serde(default)]
        utm_source: Option<String>,
    },
    Click {
        #[serde(default)]
        href: Option<String>,
        #[serde(default)]
        classes: Vec<String>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        element: String,
    },
    Scroll {
        #[serde(default)]
        depth_percent: u8,
    },
    FormSubmit {
        #[serde(default)]
        form_id: String,
        #[serde(default)]
        field_count: u32,
    },
    PopupShown {
        #[serde(default)]
        popup_id: String,
    },
    PopupInteraction {
        #[serde(default)]
        popup_id: String,
        #[serde(default)]
        action: String,
    },
    ResourceAccess {
        #[serde(default)]
        url: String,
    },
    Video {
        action: VideoAction,
        #[serde(default)]
        video_id: String,
        #[serde(default)]
        position_secs: f64,
    },
    VisibilityHidden,
    PageExit {
        exit: ExitKind,
    },
    BfCacheRestore,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageEvent {
    /// Host timestamp in epoch milliseconds; replay logs carry it, live
    /// hosts may omit it and let trackers read the runtime clock.
    #[serde(default)]
    pub at_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: PageEventKind,
}

impl PageEvent {
    pub fn new(kind: PageEventKind) -> Self {
        Self { at_ms: None, kind }
    }

    pub fn at(at_ms: u64, kind: PageEventKind) -> Self {
        Self {
            at_ms: Some(at_ms),
            kind,
        }
    }
}

/// In-memory broadcast bus for `PageEvent`.
pub struct PageEventBus {
    sender: broadcast::Sender<PageEvent>,
}

impl PageEventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    /// Publish to all current subscribers. Publishing with no subscribers
    /// is not an error from the host's point of view, only a debug note.
    pub fn publish(&self, event: PageEvent) -> Result<usize, PulseError> {
        match self.sender.send(event) {
            Ok(delivered) => Ok(delivered),
            Err(_) => {
                debug!("page event published with no subscribers");
                Ok(0)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Bridge a subscription into an mpsc receiver so sequential consumers
/// (the replay runtime) can await events without broadcast lag handling.
pub fn to_mpsc(bus: Arc<PageEventBus>, capacity: usize) -> mpsc::Receiver<PageEvent> {
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    out_rx
}
