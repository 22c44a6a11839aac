//! Page exit handling.
//!
//! Unload and pagehide mean the page is going away: settle the open
//! dwell, close the session and force the pending attribute batch out.
//! A hidden tab only refreshes activity, and a back/forward-cache
//! restore is not a new visit.

use std::sync::Arc;

use tracing::debug;

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_event_bus::ExitKind;
use pagepulse_session_center::{CloseReason, SessionEngine};

use crate::trackers::page_view::PageViewTracker;

pub struct ExitTracker {
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
    page_view: Arc<PageViewTracker>,
}

impl ExitTracker {
    pub fn new(
        session: Arc<SessionEngine>,
        attributes: Arc<AttributeEngine>,
        page_view: Arc<PageViewTracker>,
    ) -> Self {
        Self {
            session,
            attributes,
            page_view,
        }
    }

    pub async fn handle_exit(&self, exit: ExitKind) {
        debug!(?exit, "page exit");
        self.page_view.page_closing().await;
        self.session.close(CloseReason::PageExit).await;
        self.attributes.flush_now().await;
    }

    pub async fn handle_hidden(&self) {
        self.session.touch();
    }

    pub fn handle_restore(&self) {
        debug!("back/forward cache restore ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScrollRules;
    use pagepulse_core_types::ManualClock;
    use pagepulse_dispatch::{Dispatcher, RecordingSink};
    use pagepulse_kv_store::MemoryStore;

    fn tracker() -> (ExitTracker, Arc<RecordingSink>, Arc<SessionEngine>, Arc<ManualClock>) {
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::with_sink(sink.clone());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::new());
        let session = SessionEngine::new(
            Default::default(),
            clock.clone(),
            store.clone(),
            dispatcher.clone(),
        );
        let attributes = AttributeEngine::new(
            Default::default(),
            clock.clone(),
            store,
            dispatcher.clone(),
        );
        let page_view = PageViewTracker::new(
            &ScrollRules::default(),
            clock.clone(),
            dispatcher,
            session.clone(),
            attributes.clone(),
        );
        (
            ExitTracker::new(session.clone(), attributes, page_view),
            sink,
            session,
            clock,
        )
    }

    #[tokio::test]
    async fn unload_closes_the_session() {
        let (tracker, sink, session, _clock) = tracker();
        session.initialize().await;
        tracker.handle_exit(ExitKind::Unload).await;
        assert!(session.current().is_none());
        let ended = sink.tracked("session_end");
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0]["close_reason"], serde_json::json!("page_exit"));
    }

    #[tokio::test]
    async fn hidden_tab_only_refreshes_activity() {
        let (tracker, sink, session, clock) = tracker();
        session.initialize().await;
        clock.advance(5_000);
        tracker.handle_hidden().await;
        assert!(session.current().is_some());
        assert!(sink.tracked("session_end").is_empty());
        assert_eq!(
            session.current().expect("open session").last_activity_ms,
            1_005_000
        );
    }
}
