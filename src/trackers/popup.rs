//! Popup impressions and interactions.
//!
//! Only interactions count toward the visitor profile; an impression is
//! a passive event.

use std::sync::Arc;

use serde_json::{json, Map};

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_dispatch::Dispatcher;
use pagepulse_session_center::SessionEngine;

pub struct PopupTracker {
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
}

impl PopupTracker {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        session: Arc<SessionEngine>,
        attributes: Arc<AttributeEngine>,
    ) -> Self {
        Self {
            dispatcher,
            session,
            attributes,
        }
    }

    pub async fn handle_shown(&self, popup_id: &str) {
        let mut props = Map::new();
        props.insert("popup_id".into(), json!(popup_id));
        self.dispatcher.track("popup_shown", props).await;
    }

    pub async fn handle_interaction(&self, popup_id: &str, action: &str) {
        self.session.record_activity().await;
        self.attributes.record_popup_interaction().await;

        let mut props = Map::new();
        props.insert("popup_id".into(), json!(popup_id));
        props.insert("action".into(), json!(action));
        self.dispatcher.track("popup_interaction", props).await;
    }
}
