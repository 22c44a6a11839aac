//! Download detection for directly accessed resources.

use std::sync::Arc;

use serde_json::{json, Map};
use tracing::debug;

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_dispatch::Dispatcher;
use pagepulse_session_center::SessionEngine;

use crate::config::ClickRules;
use crate::trackers::click::url_extension;

/// Shares the click tracker's extension table: a resource fetched by URL
/// and a download link both mean the same thing to the profile.
pub struct ResourceTracker {
    download_extensions: Vec<String>,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
}

impl ResourceTracker {
    pub fn new(
        rules: &ClickRules,
        dispatcher: Arc<Dispatcher>,
        session: Arc<SessionEngine>,
        attributes: Arc<AttributeEngine>,
    ) -> Self {
        Self {
            download_extensions: rules.download_extensions.clone(),
            dispatcher,
            session,
            attributes,
        }
    }

    pub async fn handle(&self, url: &str) {
        let Some(extension) = url_extension(url) else {
            return;
        };
        if !self
            .download_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(extension))
        {
            debug!(url, extension, "resource access is not a tracked download");
            return;
        }
        let extension = extension.to_ascii_lowercase();

        self.session.record_activity().await;
        self.attributes.record_download().await;

        let mut props = Map::new();
        props.insert("url".into(), json!(url));
        props.insert("extension".into(), json!(extension));
        self.dispatcher.track("resource_download", props).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepulse_core_types::ManualClock;
    use pagepulse_dispatch::RecordingSink;
    use pagepulse_kv_store::MemoryStore;

    fn tracker() -> (ResourceTracker, Arc<RecordingSink>) {
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::with_sink(sink.clone());
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let session = SessionEngine::new(
            Default::default(),
            clock.clone(),
            store.clone(),
            dispatcher.clone(),
        );
        let attributes =
            AttributeEngine::new(Default::default(), clock, store, dispatcher.clone());
        (
            ResourceTracker::new(&ClickRules::default(), dispatcher, session, attributes),
            sink,
        )
    }

    #[tokio::test]
    async fn tracked_extensions_count_as_downloads() {
        let (tracker, sink) = tracker();
        tracker.handle("/files/pricing.PDF").await;
        let tracked = sink.tracked("resource_download");
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0]["extension"], json!("pdf"));
        assert_eq!(tracker.attributes.profile().total_downloads, 1);
    }

    #[tokio::test]
    async fn other_resources_are_ignored() {
        let (tracker, sink) = tracker();
        tracker.handle("/images/logo.svg").await;
        tracker.handle("/about").await;
        assert!(sink.tracked("resource_download").is_empty());
        assert_eq!(tracker.attributes.profile().total_downloads, 0);
    }
}
