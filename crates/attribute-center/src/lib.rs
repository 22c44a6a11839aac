//! Visitor attribute aggregation.
//!
//! Maintains the cumulative [`VisitorProfile`], recomputes the derived
//! classifications on every relevant mutation and pushes updates to the
//! dispatch facade: monotonic counters and set-once facts immediately
//! (under-counting is worse than a noisier network pattern), label changes
//! through a debounced, de-duplicated batch with per-class suppression
//! windows.

mod batch;
mod classify;
mod profile;

pub use batch::{Debounce, PendingBatch, UpdateMethod};
pub use classify::{
    engagement_level, engagement_score, interaction_frequency, lifecycle_stage, Level,
    LifecycleStage,
};
pub use profile::{DepthBucket, VisitorProfile, VIEWED_PAGES_CAP};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use pagepulse_core_types::{format_event_time, Clock};
use pagepulse_dispatch::Dispatcher;
use pagepulse_kv_store::{KvBackend, KvExt};
use pagepulse_session_center::{SessionObserver, SessionSnapshot};

const PROFILE_KEY: &str = "visitor_profile";
const INITIALIZED_KEY: &str = "visitor_initialized";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttributeConfig {
    /// Trailing-edge delay before a queued batch flushes.
    pub debounce_ms: u64,
    /// Minimum gap between engagement-level dispatches.
    pub engagement_window_ms: u64,
    /// Minimum gap between interaction-frequency dispatches.
    pub frequency_window_ms: u64,
    /// Per-bucket gap absorbing duplicate depth triggers.
    pub depth_window_ms: u64,
}

impl Default for AttributeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            engagement_window_ms: 10_000,
            frequency_window_ms: 15_000,
            depth_window_ms: 5_000,
        }
    }
}

/// First-touch attribution captured on page load.
#[derive(Clone, Debug, Default)]
pub struct FirstTouch {
    pub utm_source: Option<String>,
    pub referrer_domain: Option<String>,
}

impl FirstTouch {
    /// Attribution precedence: UTM source, then referrer domain, then
    /// direct.
    pub fn traffic_source(&self) -> String {
        self.utm_source
            .clone()
            .or_else(|| self.referrer_domain.clone())
            .unwrap_or_else(|| "direct".to_string())
    }
}

struct EngineState {
    profile: VisitorProfile,
    pending: PendingBatch,
    last_engagement: Option<(u64, &'static str)>,
    engagement_sent_ms: u64,
    last_frequency: Option<&'static str>,
    frequency_sent_ms: u64,
    last_stage: Option<&'static str>,
    depth_sent_ms: BTreeMap<DepthBucket, u64>,
}

pub struct AttributeEngine {
    config: AttributeConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KvBackend>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<EngineState>,
    debounce: Debounce,
}

impl AttributeEngine {
    pub fn new(
        config: AttributeConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KvBackend>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        let profile: VisitorProfile = store.get_json(PROFILE_KEY).unwrap_or_default();
        Arc::new(Self {
            config,
            clock,
            store,
            dispatcher,
            state: Mutex::new(EngineState {
                profile,
                pending: PendingBatch::default(),
                last_engagement: None,
                engagement_sent_ms: 0,
                last_frequency: None,
                frequency_sent_ms: 0,
                last_stage: None,
                depth_sent_ms: BTreeMap::new(),
            }),
            debounce: Debounce::new(),
        })
    }

    /// First-visit bookkeeping, guarded by a storage marker so a second
    /// engine instance in the same page lifetime cannot re-run it.
    pub async fn initialize(self: &Arc<Self>, first_touch: FirstTouch) {
        let now = self.clock.now_ms();
        let already = self.store.get_bool(INITIALIZED_KEY).unwrap_or(false);

        let (set_once, appended) = {
            let mut state = self.state.lock();
            let source = first_touch.traffic_source();
            let newly_seen = state.profile.traffic_sources_used.insert(source.clone());
            if newly_seen {
                state.pending.queue(
                    UpdateMethod::UserUniqAppend,
                    props([("traffic_sources_used", json!([source.clone()]))]),
                );
            }

            let set_once = if already {
                None
            } else {
                self.store.set_bool(INITIALIZED_KEY, true);
                if state.profile.first_visit_ms.is_none() {
                    state.profile.first_visit_ms = Some(now);
                }
                if state.profile.first_utm_source.is_none() {
                    state.profile.first_utm_source = first_touch.utm_source.clone();
                }
                if state.profile.first_referrer_domain.is_none() {
                    state.profile.first_referrer_domain = first_touch.referrer_domain.clone();
                }
                let mut once = props([("first_visit_timestamp", json!(format_event_time(now)))]);
                if let Some(utm) = &state.profile.first_utm_source {
                    once.insert("first_utm_source".into(), json!(utm));
                }
                if let Some(referrer) = &state.profile.first_referrer_domain {
                    once.insert("first_referrer_domain".into(), json!(referrer));
                }
                Some(once)
            };
            self.persist(&state.profile);
            (set_once, newly_seen)
        };

        if let Some(once) = set_once {
            self.dispatcher.user_set_once(once).await;
        }
        if appended {
            self.schedule_flush();
        }
    }

    /// One form submission: +50 engagement points.
    pub async fn record_form_submission(self: &Arc<Self>) {
        self.bump(|p| p.total_form_submissions += 1, "total_form_submissions")
            .await;
    }

    /// One tracked file download: +30 engagement points.
    pub async fn record_download(self: &Arc<Self>) {
        self.bump(|p| p.total_downloads += 1, "total_downloads").await;
    }

    /// Full-depth scroll reached on some page.
    pub async fn record_scroll_100(self: &Arc<Self>) {
        self.bump(|p| p.total_scroll_depth_100 += 1, "total_scroll_depth_100")
            .await;
    }

    pub async fn record_popup_interaction(self: &Arc<Self>) {
        self.bump(|p| p.popup_interactions += 1, "popup_interactions")
            .await;
    }

    pub async fn record_external_link_click(self: &Arc<Self>) {
        self.bump(|p| p.external_link_clicks += 1, "external_link_clicks")
            .await;
    }

    /// Accumulated dwell time in seconds.
    pub async fn add_time_spent(self: &Arc<Self>, secs: u64) {
        if secs == 0 {
            return;
        }
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            state.profile.total_time_spent_secs += secs;
            self.reclassify(&mut state, now);
            self.persist(&state.profile);
        }
        self.dispatcher
            .user_add(props([("total_time_spent", json!(secs))]))
            .await;
        self.schedule_flush();
    }

    /// Page view: viewed-pages ring, section interest and lifecycle.
    pub async fn record_page_view(self: &Arc<Self>, url: &str, section: Option<&str>) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            state.profile.push_viewed_page(url);
            state.pending.queue(
                UpdateMethod::UserUniqAppend,
                props([("viewed_pages", json!([url]))]),
            );
            if let Some(section) = section {
                state.profile.record_section_visit(section);
            }
            self.reclassify(&mut state, now);
            self.persist(&state.profile);
        }
        self.schedule_flush();
    }

    /// A content-depth engagement event. The bucket increment always
    /// lands; the preference dispatch is absorbed when the same bucket
    /// fired within the suppression window.
    pub async fn record_content_depth(self: &Arc<Self>, bucket: DepthBucket) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            state.profile.record_depth(bucket);
            let suppressed = state
                .depth_sent_ms
                .get(&bucket)
                .is_some_and(|sent| now.saturating_sub(*sent) < self.config.depth_window_ms);
            if !suppressed {
                if let Some(preference) = state.profile.depth_preference() {
                    let label = preference.label();
                    if state.profile.content_depth_preference.as_deref() != Some(label) {
                        state.profile.content_depth_preference = Some(label.to_string());
                        state.pending.queue(
                            UpdateMethod::UserSet,
                            props([("content_depth_preference", json!(label))]),
                        );
                    }
                    state.depth_sent_ms.insert(bucket, now);
                }
            }
            self.persist(&state.profile);
        }
        self.schedule_flush();
    }

    /// Queue an arbitrary partial update on the shared batch. Exposed for
    /// trackers with one-off fields (video milestones, popup variants).
    pub fn queue_update(self: &Arc<Self>, method: UpdateMethod, partial: Map<String, Value>) {
        self.state.lock().pending.queue(method, partial);
        self.schedule_flush();
    }

    /// Flush the pending batch now: one merged `user_set`, additive calls
    /// in enqueue order. The queue is cleared whatever the sink outcome.
    pub async fn flush_now(&self) {
        self.debounce.cancel();
        self.flush_pending().await;
    }

    async fn flush_pending(&self) {
        let (set, additive) = self.state.lock().pending.drain();
        if let Some(set) = set {
            self.dispatcher.user_set(set).await;
        }
        for (method, partial) in additive {
            match method {
                UpdateMethod::UserAdd => self.dispatcher.user_add(partial).await,
                UpdateMethod::UserUniqAppend => self.dispatcher.user_uniq_append(partial).await,
                UpdateMethod::UserSet => self.dispatcher.user_set(partial).await,
            }
        }
    }

    /// Current profile snapshot.
    pub fn profile(&self) -> VisitorProfile {
        self.state.lock().profile.clone()
    }

    async fn bump(self: &Arc<Self>, mutate: impl FnOnce(&mut VisitorProfile), field: &'static str) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            mutate(&mut state.profile);
            self.reclassify(&mut state, now);
            self.persist(&state.profile);
        }
        // Monotonic counters bypass the batch: losing one to a page
        // unload race costs data, while an extra request costs nothing.
        self.dispatcher.user_add(props([(field, json!(1))])).await;
        self.schedule_flush();
    }

    /// Recompute every derived classification from the counters and queue
    /// the ones that changed, subject to their suppression windows. A
    /// change suppressed inside its window is not rescheduled: it goes out
    /// with the next mutation after the window opens, and until then the
    /// last dispatched label stands.
    fn reclassify(&self, state: &mut EngineState, now: u64) {
        let score = engagement_score(&state.profile);
        let level = engagement_level(score).label();
        let changed = state.last_engagement != Some((score, level));
        if changed && now.saturating_sub(state.engagement_sent_ms) >= self.config.engagement_window_ms
        {
            state.profile.engagement_level = Some(level.to_string());
            state.pending.queue(
                UpdateMethod::UserSet,
                props([
                    ("engagement_level", json!(level)),
                    ("engagement_score", json!(score)),
                ]),
            );
            state.last_engagement = Some((score, level));
            state.engagement_sent_ms = now;
            debug!(score, level, "engagement level queued");
        }

        let frequency = interaction_frequency(&state.profile).label();
        let changed = state.last_frequency != Some(frequency);
        if changed && now.saturating_sub(state.frequency_sent_ms) >= self.config.frequency_window_ms
        {
            state.profile.interaction_frequency = Some(frequency.to_string());
            state.pending.queue(
                UpdateMethod::UserSet,
                props([("interaction_frequency", json!(frequency))]),
            );
            state.last_frequency = Some(frequency);
            state.frequency_sent_ms = now;
        }

        let stage = lifecycle_stage(&state.profile).label();
        if state.last_stage != Some(stage) {
            state.profile.visitor_lifecycle_stage = Some(stage.to_string());
            state.pending.queue(
                UpdateMethod::UserSet,
                props([("visitor_lifecycle_stage", json!(stage))]),
            );
            state.last_stage = Some(stage);
        }
    }

    fn persist(&self, profile: &VisitorProfile) {
        self.store.set_json(PROFILE_KEY, profile);
    }

    fn schedule_flush(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        self.debounce.schedule(
            Duration::from_millis(self.config.debounce_ms),
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.flush_pending().await;
                }
            },
        );
    }
}

#[async_trait]
impl SessionObserver for AttributeEngine {
    async fn session_started(&self, snapshot: &SessionSnapshot) {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock();
            state.profile.total_sessions += 1;
            self.reclassify(&mut state, now);
            self.persist(&state.profile);
        }
        debug!(session_number = snapshot.number, "session counted for visitor");
        self.dispatcher
            .user_add(props([("total_sessions", json!(1))]))
            .await;
    }
}

fn props(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagepulse_core_types::ManualClock;
    use pagepulse_dispatch::{RecordingSink, SinkCall};
    use pagepulse_kv_store::MemoryStore;

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        engine: Arc<AttributeEngine>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new());
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::with_sink(sink.clone());
        let engine = AttributeEngine::new(
            AttributeConfig::default(),
            clock.clone(),
            store.clone(),
            dispatcher,
        );
        Harness {
            clock,
            store,
            sink,
            engine,
        }
    }

    fn user_sets(calls: &[SinkCall]) -> Vec<Map<String, Value>> {
        calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::UserSet(fields) => Some(fields.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn first_visit_bookkeeping_runs_once() {
        let h = harness();
        h.engine
            .initialize(FirstTouch {
                utm_source: Some("newsletter".into()),
                referrer_domain: None,
            })
            .await;
        // A second instance over the same store must not repeat it.
        let second = AttributeEngine::new(
            AttributeConfig::default(),
            h.clock.clone(),
            h.store.clone(),
            Dispatcher::with_sink(h.sink.clone()),
        );
        second.initialize(FirstTouch::default()).await;

        let set_once: Vec<_> = h
            .sink
            .calls()
            .into_iter()
            .filter(|call| matches!(call, SinkCall::UserSetOnce(_)))
            .collect();
        assert_eq!(set_once.len(), 1);
        match &set_once[0] {
            SinkCall::UserSetOnce(fields) => {
                assert!(fields.contains_key("first_visit_timestamp"));
                assert_eq!(fields["first_utm_source"], json!("newsletter"));
            }
            _ => unreachable!(),
        }
        assert_eq!(
            second.profile().first_utm_source.as_deref(),
            Some("newsletter")
        );
    }

    #[tokio::test]
    async fn counters_dispatch_immediately() {
        let h = harness();
        h.engine.record_form_submission().await;
        h.engine.record_download().await;
        let adds: Vec<_> = h
            .sink
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::UserAdd(fields) => Some(fields),
                _ => None,
            })
            .collect();
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0]["total_form_submissions"], json!(1));
        assert_eq!(adds[1]["total_downloads"], json!(1));
    }

    #[tokio::test]
    async fn batch_merges_set_updates_before_flush() {
        let h = harness();
        h.engine
            .queue_update(UpdateMethod::UserSet, props([("a", json!(1))]));
        h.engine.queue_update(
            UpdateMethod::UserSet,
            props([("a", json!(2)), ("b", json!(3))]),
        );
        h.engine.flush_now().await;

        let sets = user_sets(&h.sink.calls());
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0]["a"], json!(2));
        assert_eq!(sets[0]["b"], json!(3));
    }

    #[tokio::test]
    async fn flush_clears_queue_even_when_sink_fails() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new());
        let engine = AttributeEngine::new(
            AttributeConfig::default(),
            clock,
            store,
            Dispatcher::with_sink(pagepulse_dispatch::FailingSink::new()),
        );
        engine.queue_update(UpdateMethod::UserSet, props([("a", json!(1))]));
        engine.flush_now().await;
        // Queue is gone; a second flush has nothing to send.
        assert!(engine.state.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn engagement_dispatch_suppressed_inside_window() {
        let h = harness();
        h.engine.record_form_submission().await; // score 50 -> medium
        h.engine.flush_now().await;
        let before = user_sets(&h.sink.calls())
            .iter()
            .filter(|fields| fields.contains_key("engagement_level"))
            .count();
        assert_eq!(before, 1);

        // Rapid follow-up inside the 10 s window: counter lands, label
        // dispatch is suppressed.
        h.clock.advance(3_000);
        h.engine.record_form_submission().await;
        h.engine.flush_now().await;
        let inside = user_sets(&h.sink.calls())
            .iter()
            .filter(|fields| fields.contains_key("engagement_level"))
            .count();
        assert_eq!(inside, 1);

        // After the window a changed score dispatches again.
        h.clock.advance(10_000);
        h.engine.record_form_submission().await;
        h.engine.flush_now().await;
        let after = user_sets(&h.sink.calls())
            .iter()
            .filter(|fields| fields.contains_key("engagement_level"))
            .count();
        assert_eq!(after, 2);
    }

    #[tokio::test]
    async fn frequency_dispatch_suppressed_inside_window() {
        let h = harness();
        h.engine.record_form_submission().await; // ratio 1 -> medium
        h.engine.flush_now().await;
        let before = user_sets(&h.sink.calls())
            .iter()
            .filter(|fields| fields.contains_key("interaction_frequency"))
            .count();
        assert_eq!(before, 1);

        // Two more interactions inside the 15 s window lift the ratio to
        // high, but the label dispatch is suppressed.
        h.clock.advance(3_000);
        h.engine.record_download().await;
        h.engine.record_popup_interaction().await;
        h.engine.flush_now().await;
        let inside = user_sets(&h.sink.calls())
            .iter()
            .filter(|fields| fields.contains_key("interaction_frequency"))
            .count();
        assert_eq!(inside, 1);

        // After the window the still-changed label goes out.
        h.clock.advance(15_000);
        h.engine.record_external_link_click().await;
        h.engine.flush_now().await;
        let dispatched: Vec<_> = user_sets(&h.sink.calls())
            .into_iter()
            .filter_map(|fields| fields.get("interaction_frequency").cloned())
            .collect();
        assert_eq!(dispatched, vec![json!("medium"), json!("high")]);
    }

    #[tokio::test]
    async fn lifecycle_stage_dispatches_on_change_only() {
        let h = harness();
        h.engine.record_page_view("/pricing", None).await;
        h.engine.record_page_view("/blog", None).await;
        h.engine.flush_now().await;
        let stages: Vec<_> = user_sets(&h.sink.calls())
            .into_iter()
            .filter_map(|fields| fields.get("visitor_lifecycle_stage").cloned())
            .collect();
        assert_eq!(stages, vec![json!("awareness")]);

        h.engine.record_form_submission().await;
        h.engine.flush_now().await;
        let stages: Vec<_> = user_sets(&h.sink.calls())
            .into_iter()
            .filter_map(|fields| fields.get("visitor_lifecycle_stage").cloned())
            .collect();
        assert_eq!(stages, vec![json!("awareness"), json!("decision")]);
    }

    #[tokio::test]
    async fn depth_preference_suppresses_duplicate_bucket_triggers() {
        let h = harness();
        h.engine.record_content_depth(DepthBucket::Deep).await;
        // Duplicate trigger 1 s later: absorbed.
        h.clock.advance(1_000);
        h.engine.record_content_depth(DepthBucket::Deep).await;
        h.engine.flush_now().await;

        let prefs = user_sets(&h.sink.calls())
            .iter()
            .filter(|fields| fields.contains_key("content_depth_preference"))
            .count();
        assert_eq!(prefs, 1);
        assert_eq!(h.engine.profile().depth_table[&DepthBucket::Deep], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_flushes_after_two_seconds() {
        let h = harness();
        h.engine
            .queue_update(UpdateMethod::UserSet, props([("a", json!(1))]));
        assert!(user_sets(&h.sink.calls()).is_empty());
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(user_sets(&h.sink.calls()).len(), 1);
    }

    #[tokio::test]
    async fn profile_round_trips_across_reload() {
        let h = harness();
        h.engine
            .initialize(FirstTouch {
                utm_source: Some("google".into()),
                referrer_domain: Some("google.com".into()),
            })
            .await;
        h.engine.record_download().await;
        h.engine.record_page_view("/docs", Some("company")).await;

        let reloaded = AttributeEngine::new(
            AttributeConfig::default(),
            h.clock.clone(),
            h.store.clone(),
            Dispatcher::with_sink(RecordingSink::new()),
        );
        let profile = reloaded.profile();
        assert_eq!(profile.total_downloads, 1);
        assert_eq!(profile.company_section_views, 1);
        assert_eq!(profile.first_utm_source.as_deref(), Some("google"));
        assert!(profile.viewed_pages.contains(&"/docs".to_string()));
    }
}
