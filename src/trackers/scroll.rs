//! Scroll depth thresholds, reported once each per page.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map};
use tracing::debug;

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_dispatch::Dispatcher;
use pagepulse_session_center::SessionEngine;

use crate::config::ScrollRules;

pub struct ScrollTracker {
    thresholds: Vec<u8>,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
    reported_max: Mutex<u8>,
}

impl ScrollTracker {
    pub fn new(
        rules: &ScrollRules,
        dispatcher: Arc<Dispatcher>,
        session: Arc<SessionEngine>,
        attributes: Arc<AttributeEngine>,
    ) -> Self {
        let mut thresholds = rules.thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            thresholds,
            dispatcher,
            session,
            attributes,
            reported_max: Mutex::new(0),
        }
    }

    /// Forget reported thresholds; called on every page view.
    pub fn reset_page(&self) {
        *self.reported_max.lock() = 0;
    }

    pub async fn handle(&self, depth_percent: u8) {
        let crossed: Vec<u8> = {
            let mut reported = self.reported_max.lock();
            let crossed = self
                .thresholds
                .iter()
                .copied()
                .filter(|threshold| *threshold > *reported && depth_percent >= *threshold)
                .collect::<Vec<u8>>();
            if let Some(highest) = crossed.last() {
                *reported = *highest;
            }
            crossed
        };
        if crossed.is_empty() {
            return;
        }
        debug!(depth_percent, ?crossed, "scroll thresholds crossed");

        self.session.record_activity().await;
        for threshold in crossed {
            let mut props = Map::new();
            props.insert("depth".into(), json!(threshold));
            self.dispatcher.track("scroll_depth", props).await;
            if threshold == 100 {
                self.attributes.record_scroll_100().await;
            }
        }
    }
}
