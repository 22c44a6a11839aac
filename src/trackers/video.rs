//! Video playback events.

use std::sync::Arc;

use serde_json::{json, Map};

use pagepulse_dispatch::Dispatcher;
use pagepulse_event_bus::VideoAction;
use pagepulse_session_center::SessionEngine;

pub struct VideoTracker {
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
}

impl VideoTracker {
    pub fn new(dispatcher: Arc<Dispatcher>, session: Arc<SessionEngine>) -> Self {
        Self { dispatcher, session }
    }

    pub async fn handle(&self, action: VideoAction, video_id: &str, position_secs: f64) {
        // Starting or finishing playback is deliberate; progress ticks
        // and pauses are not counted as interactions.
        if matches!(action, VideoAction::Play | VideoAction::Complete) {
            self.session.record_activity().await;
        }

        let event = match action {
            VideoAction::Play => "video_play",
            VideoAction::Pause => "video_pause",
            VideoAction::Progress => "video_progress",
            VideoAction::Complete => "video_complete",
        };
        let mut props = Map::new();
        props.insert("video_id".into(), json!(video_id));
        props.insert("position_secs".into(), json!(position_secs));
        self.dispatcher.track(event, props).await;
    }
}
