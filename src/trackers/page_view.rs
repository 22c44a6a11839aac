//! Page views: attribution, section interest and dwell-based depth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map};
use tracing::debug;

use pagepulse_attribute_center::{AttributeEngine, DepthBucket, FirstTouch};
use pagepulse_core_types::Clock;
use pagepulse_dispatch::Dispatcher;
use pagepulse_session_center::SessionEngine;

use crate::config::ScrollRules;
use crate::trackers::click::url_host;

struct OpenPage {
    since_ms: u64,
}

pub struct PageViewTracker {
    surface_dwell_secs: u64,
    deep_dwell_secs: u64,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
    open: Mutex<Option<OpenPage>>,
    attributed: AtomicBool,
}

impl PageViewTracker {
    pub fn new(
        rules: &ScrollRules,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<Dispatcher>,
        session: Arc<SessionEngine>,
        attributes: Arc<AttributeEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            surface_dwell_secs: rules.surface_dwell_secs,
            deep_dwell_secs: rules.deep_dwell_secs,
            clock,
            dispatcher,
            session,
            attributes,
            open: Mutex::new(None),
            attributed: AtomicBool::new(false),
        })
    }

    pub async fn handle(&self, url: &str, title: &str, referrer: &str, utm_source: Option<&str>) {
        let now = self.clock.now_ms();

        // Traffic attribution belongs to the first view of this page
        // lifetime; later views keep the original source.
        if !self.attributed.swap(true, Ordering::SeqCst) {
            let first_touch = FirstTouch {
                utm_source: utm_source.map(str::to_string),
                referrer_domain: url_host(referrer).map(str::to_string),
            };
            self.attributes.initialize(first_touch).await;
        }

        self.settle_open_page(now).await;
        self.session.record_activity().await;
        self.attributes.record_page_view(url, section_of(url)).await;

        let mut props = Map::new();
        props.insert("url".into(), json!(url));
        if !title.is_empty() {
            props.insert("title".into(), json!(title));
        }
        if !referrer.is_empty() {
            props.insert("referrer".into(), json!(referrer));
        }
        if let Some(utm) = utm_source {
            props.insert("utm_source".into(), json!(utm));
        }
        self.dispatcher.track("page_view", props).await;

        *self.open.lock() = Some(OpenPage { since_ms: now });
    }

    /// Settle the dwell of the page being left; called on the next page
    /// view and by the exit tracker.
    pub async fn page_closing(&self) {
        let now = self.clock.now_ms();
        self.settle_open_page(now).await;
    }

    async fn settle_open_page(&self, now: u64) {
        let Some(open) = self.open.lock().take() else {
            return;
        };
        let dwell_secs = now.saturating_sub(open.since_ms) / 1_000;
        let bucket = self.depth_bucket(dwell_secs);
        debug!(dwell_secs, ?bucket, "page dwell settled");
        self.attributes.add_time_spent(dwell_secs).await;
        self.attributes.record_content_depth(bucket).await;
    }

    fn depth_bucket(&self, dwell_secs: u64) -> DepthBucket {
        if dwell_secs < self.surface_dwell_secs {
            DepthBucket::Surface
        } else if dwell_secs < self.deep_dwell_secs {
            DepthBucket::Medium
        } else {
            DepthBucket::Deep
        }
    }
}

/// Section interest from the URL path. Only sections that feed lifecycle
/// classification are recognized.
pub fn section_of(url: &str) -> Option<&'static str> {
    let path = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .map(|rest| rest.find('/').map(|idx| &rest[idx..]).unwrap_or("/"))
        .unwrap_or(url);
    let path = path.split(['?', '#']).next().unwrap_or_default();
    for segment in path.split('/') {
        match segment {
            "company" | "about" | "about-us" | "team" => return Some("company"),
            "case-studies" | "case-study" | "cases" | "customers" => return Some("case_study"),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepulse_core_types::ManualClock;
    use pagepulse_dispatch::RecordingSink;
    use pagepulse_kv_store::MemoryStore;

    fn tracker() -> (Arc<PageViewTracker>, Arc<RecordingSink>, Arc<ManualClock>) {
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
        (
            PageViewTracker::new(
                &ScrollRules::default(),
                clock.clone(),
                dispatcher,
                session,
                attributes,
            ),
            sink,
            clock,
        )
    }

    #[test]
    fn sections_come_from_path_segments() {
        assert_eq!(section_of("https://example.com/company/history"), Some("company"));
        assert_eq!(section_of("/about"), Some("company"));
        assert_eq!(section_of("/case-studies/acme?ref=nav"), Some("case_study"));
        assert_eq!(section_of("/blog/company-news"), None);
        assert_eq!(section_of("/pricing"), None);
    }

    #[tokio::test]
    async fn first_view_sets_first_touch_once() {
        let (tracker, sink, _clock) = tracker();
        tracker
            .handle("/landing", "Landing", "https://google.com/search", Some("newsletter"))
            .await;
        tracker.handle("/pricing", "Pricing", "", None).await;

        let set_once: Vec<_> = sink
            .calls()
            .into_iter()
            .filter(|call| matches!(call, pagepulse_dispatch::SinkCall::UserSetOnce(_)))
            .collect();
        assert_eq!(set_once.len(), 1);
        let profile = tracker.attributes.profile();
        assert_eq!(profile.first_utm_source.as_deref(), Some("newsletter"));
        assert_eq!(profile.first_referrer_domain.as_deref(), Some("google.com"));
    }

    #[tokio::test]
    async fn dwell_settles_into_depth_buckets() {
        let (tracker, _sink, clock) = tracker();
        tracker.handle("/a", "", "", None).await;
        clock.advance(5_000);
        tracker.handle("/b", "", "", None).await;
        clock.advance(200_000);
        tracker.page_closing().await;

        let profile = tracker.attributes.profile();
        assert_eq!(profile.depth_table.get(&DepthBucket::Surface), Some(&1));
        assert_eq!(profile.depth_table.get(&DepthBucket::Deep), Some(&1));
        assert_eq!(profile.total_time_spent_secs, 205);
    }

    #[tokio::test]
    async fn page_views_accumulate_section_interest() {
        let (tracker, sink, _clock) = tracker();
        tracker.handle("/case-studies/acme", "Acme", "", None).await;
        tracker.handle("/case-studies/initech", "Initech", "", None).await;
        assert_eq!(sink.tracked("page_view").len(), 2);
        let profile = tracker.attributes.profile();
        assert_eq!(profile.case_study_views, 2);
        assert_eq!(profile.viewed_pages.len(), 2);
    }
}
