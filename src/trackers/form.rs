//! Form submission tracking.

use std::sync::Arc;

use serde_json::{json, Map};
use tracing::debug;

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_dispatch::Dispatcher;
use pagepulse_session_center::SessionEngine;

use crate::config::FormRules;

pub struct FormTracker {
    rules: FormRules,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
}

impl FormTracker {
    pub fn new(
        rules: FormRules,
        dispatcher: Arc<Dispatcher>,
        session: Arc<SessionEngine>,
        attributes: Arc<AttributeEngine>,
    ) -> Self {
        Self {
            rules,
            dispatcher,
            session,
            attributes,
        }
    }

    pub async fn handle(&self, form_id: &str, field_count: u32) {
        if self.rules.ignored_form_ids.iter().any(|id| id == form_id) {
            debug!(form_id, "ignored form submission");
            return;
        }
        self.session.record_activity().await;
        self.attributes.record_form_submission().await;

        let mut props = Map::new();
        if !form_id.is_empty() {
            props.insert("form_id".into(), json!(form_id));
        }
        props.insert("field_count".into(), json!(field_count));
        self.dispatcher.track("form_submit", props).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepulse_core_types::ManualClock;
    use pagepulse_dispatch::RecordingSink;
    use pagepulse_kv_store::MemoryStore;

    fn tracker(rules: FormRules) -> (FormTracker, Arc<RecordingSink>) {
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
        (FormTracker::new(rules, dispatcher, session, attributes), sink)
    }

    #[tokio::test]
    async fn submission_feeds_event_and_profile() {
        let (tracker, sink) = tracker(FormRules::default());
        tracker.handle("contact", 4).await;
        let tracked = sink.tracked("form_submit");
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0]["form_id"], json!("contact"));
        assert_eq!(tracked[0]["field_count"], json!(4));
        assert_eq!(tracker.attributes.profile().total_form_submissions, 1);
    }

    #[tokio::test]
    async fn ignored_forms_are_dropped_entirely() {
        let rules = FormRules {
            ignored_form_ids: vec!["site-search".to_string()],
        };
        let (tracker, sink) = tracker(rules);
        tracker.handle("site-search", 1).await;
        assert!(sink.tracked("form_submit").is_empty());
        assert_eq!(tracker.attributes.profile().total_form_submissions, 0);
    }
}
