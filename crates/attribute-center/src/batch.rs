//! Pending update batch and the shared trailing-edge debounce.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

/// Remote mutation methods an update can target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateMethod {
    UserSet,
    UserAdd,
    UserUniqAppend,
}

/// Transient queue of partial attribute updates awaiting flush.
///
/// `user_set` partials collapse to a single merged object (last write wins
/// per field); additive and list methods keep every update and their
/// enqueue order. The queue is always cleared by the flush, regardless of
/// dispatch success: at-most-once semantics.
#[derive(Debug, Default)]
pub struct PendingBatch {
    set_merged: Map<String, Value>,
    additive: Vec<(UpdateMethod, Map<String, Value>)>,
}

impl PendingBatch {
    pub fn queue(&mut self, method: UpdateMethod, partial: Map<String, Value>) {
        match method {
            UpdateMethod::UserSet => {
                for (key, value) in partial {
                    self.set_merged.insert(key, value);
                }
            }
            UpdateMethod::UserAdd | UpdateMethod::UserUniqAppend => {
                self.additive.push((method, partial));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set_merged.is_empty() && self.additive.is_empty()
    }

    /// Drain the queue into the merged `user_set` object (if any) and the
    /// ordered list of additive dispatches.
    pub fn drain(&mut self) -> (Option<Map<String, Value>>, Vec<(UpdateMethod, Map<String, Value>)>) {
        let set = if self.set_merged.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.set_merged))
        };
        (set, std::mem::take(&mut self.additive))
    }
}

/// Cancel-and-reschedule trailing-edge debounce over a spawned task.
///
/// One shared utility instead of ad-hoc timers per module; `cancel` has
/// explicit semantics so the page-exit path can force a synchronous flush
/// without racing the timer.
#[derive(Default)]
pub struct Debounce {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Debounce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, cancelling any previously armed run.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });
        if let Some(previous) = self.handle.lock().replace(task) {
            previous.abort();
        }
    }

    /// Disarm without running the pending action.
    pub fn cancel(&self) {
        if let Some(task) = self.handle.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Debounce {
    fn drop(&mut self) {
        self.cancel();
    }
}
