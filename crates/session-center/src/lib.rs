//! Session lifecycle state machine.
//!
//! Owns session identity and the `Uninitialized -> Active(not engaged) ->
//! Active(engaged) -> Closed` transitions. Externally the engine behaves
//! as a ring of sessions: closing one (timeout or exit signal) immediately
//! opens the next. All session fields are persisted as scalars in the
//! key-value store so a page reload within the timeout window restores the
//! same session.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use pagepulse_core_types::{format_event_time, Clock, SessionId};
use pagepulse_dispatch::Dispatcher;
use pagepulse_kv_store::{KvBackend, KvExt};

mod keys {
    pub const SESSION_ID: &str = "session_id";
    pub const SESSION_NUMBER: &str = "session_number";
    pub const SESSION_START: &str = "session_start_time";
    pub const LAST_ACTIVITY: &str = "session_last_activity";
    pub const ENGAGED: &str = "session_engaged";
    pub const INTERACTIONS: &str = "session_interaction_count";
    pub const STATS: &str = "session_stats";
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle window after which a session is considered abandoned.
    pub timeout_ms: u64,
    /// Dwell time that promotes a session to engaged.
    pub engagement_time_ms: u64,
    /// Interaction count that promotes a session to engaged.
    pub engagement_interactions: u64,
    /// Poll interval for the timeout check loop.
    pub check_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30 * 60 * 1000,
            engagement_time_ms: 10_000,
            engagement_interactions: 2,
            check_interval_ms: 60_000,
        }
    }
}

/// Why a session was closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    Timeout,
    PageExit,
    Manual,
}

impl CloseReason {
    fn label(self) -> &'static str {
        match self {
            CloseReason::Timeout => "timeout",
            CloseReason::PageExit => "page_exit",
            CloseReason::Manual => "manual",
        }
    }
}

/// Why a session was promoted to engaged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EngagementReason {
    TimeBased,
    InteractionBased,
}

impl EngagementReason {
    fn label(self) -> &'static str {
        match self {
            EngagementReason::TimeBased => "time_based",
            EngagementReason::InteractionBased => "interaction_based",
        }
    }
}

/// Immutable view of the currently open session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub number: u64,
    pub start_ms: u64,
    pub last_activity_ms: u64,
    pub interaction_count: u64,
    pub engaged: bool,
    pub restored: bool,
}

/// Long-run statistics accumulated across closed sessions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub count: u64,
    pub engaged_count: u64,
    pub total_duration_ms: u64,
    pub avg_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl SessionStats {
    fn absorb(&mut self, duration_ms: u64, engaged: bool) {
        self.count = self.count.saturating_add(1);
        if engaged {
            self.engaged_count = self.engaged_count.saturating_add(1);
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        self.avg_duration_ms = self.total_duration_ms / self.count.max(1);
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
    }
}

/// Notified whenever a new session opens (never on restore). Lets the
/// attribute aggregator keep `total_sessions` in step without the session
/// engine knowing about visitor profiles.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn session_started(&self, snapshot: &SessionSnapshot);
}

enum State {
    Uninitialized,
    Active(ActiveSession),
    Closed,
}

struct ActiveSession {
    id: SessionId,
    number: u64,
    start_ms: u64,
    last_activity_ms: u64,
    interaction_count: u64,
    engaged: bool,
    restored: bool,
}

impl ActiveSession {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            number: self.number,
            start_ms: self.start_ms,
            last_activity_ms: self.last_activity_ms,
            interaction_count: self.interaction_count,
            engaged: self.engaged,
            restored: self.restored,
        }
    }
}

/// Outcome of [`SessionEngine::initialize`].
#[derive(Clone, Debug, PartialEq)]
pub enum InitOutcome {
    New(SessionSnapshot),
    Restored(SessionSnapshot),
    AlreadyInitialized,
}

// Deferred sink emissions, built under the state lock and dispatched after
// the guard is released.
enum Emit {
    Track(&'static str, Map<String, Value>),
}

pub struct SessionEngine {
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KvBackend>,
    dispatcher: Arc<Dispatcher>,
    context: Map<String, Value>,
    observer: Mutex<Option<Arc<dyn SessionObserver>>>,
    state: Mutex<State>,
}

impl SessionEngine {
    pub fn new(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KvBackend>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            store,
            dispatcher,
            context: Map::new(),
            observer: Mutex::new(None),
            state: Mutex::new(State::Uninitialized),
        })
    }

    /// Same as [`SessionEngine::new`] but with static page/host context
    /// attached to every `session_start` event.
    pub fn with_context(
        config: SessionConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KvBackend>,
        dispatcher: Arc<Dispatcher>,
        context: Map<String, Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            store,
            dispatcher,
            context,
            observer: Mutex::new(None),
            state: Mutex::new(State::Uninitialized),
        })
    }

    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.observer.lock() = Some(observer);
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Read persisted identity and either restore the prior session or
    /// start a new one. Restoration requires the idle window to still be
    /// open and the whole session to be younger than twice the timeout.
    pub async fn initialize(&self) -> InitOutcome {
        let now = self.clock.now_ms();
        let (outcome, emits) = {
            let mut state = self.state.lock();
            if matches!(*state, State::Active(_)) {
                warn!("session engine initialized twice; ignoring");
                return InitOutcome::AlreadyInitialized;
            }

            let persisted = self.read_persisted();
            match persisted {
                Some(prior)
                    if now.saturating_sub(prior.last_activity_ms) < self.config.timeout_ms
                        && now.saturating_sub(prior.start_ms) < 2 * self.config.timeout_ms =>
                {
                    let active = ActiveSession {
                        id: prior.id,
                        number: prior.number,
                        start_ms: prior.start_ms,
                        last_activity_ms: now,
                        interaction_count: prior.interaction_count,
                        engaged: prior.engaged,
                        restored: true,
                    };
                    let snapshot = active.snapshot();
                    self.persist(&active);
                    *state = State::Active(active);
                    debug!(session_id = %snapshot.id, number = snapshot.number, "restored session");
                    (InitOutcome::Restored(snapshot), Vec::new())
                }
                _ => {
                    let (active, emits) = self.open_session(now);
                    let snapshot = active.snapshot();
                    *state = State::Active(active);
                    (InitOutcome::New(snapshot), emits)
                }
            }
        };
        self.dispatch_emits(emits).await;
        if let InitOutcome::New(snapshot) = &outcome {
            self.notify_started(snapshot).await;
        }
        outcome
    }

    /// Record one tracked interaction: refresh the idle clock, bump the
    /// monotonic interaction counter and promote engagement at most once.
    pub async fn record_activity(&self) {
        let now = self.clock.now_ms();
        let emits = {
            let mut state = self.state.lock();
            let State::Active(active) = &mut *state else {
                return;
            };
            active.last_activity_ms = now;
            active.interaction_count = active.interaction_count.saturating_add(1);

            let mut emits = Vec::new();
            if !active.engaged {
                let reason = if now.saturating_sub(active.start_ms) >= self.config.engagement_time_ms
                {
                    Some(EngagementReason::TimeBased)
                } else if active.interaction_count >= self.config.engagement_interactions {
                    Some(EngagementReason::InteractionBased)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    active.engaged = true;
                    let mut props = self.session_props(active, now);
                    props.insert("engagement_reason".into(), json!(reason.label()));
                    emits.push(Emit::Track("session_engaged", props));
                    info!(session_id = %active.id, reason = reason.label(), "session engaged");
                }
            }
            self.persist(active);
            emits
        };
        self.dispatch_emits(emits).await;
    }

    /// Refresh the idle clock without counting an interaction. Bound to
    /// the tab-hidden signal, which must not close the session.
    pub fn touch(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if let State::Active(active) = &mut *state {
            active.last_activity_ms = now;
            self.store.set_u64(keys::LAST_ACTIVITY, now);
        }
    }

    /// Periodic tick: close an idle session and immediately open the next
    /// one. Idempotent under repeated ticks.
    pub async fn check_timeout(&self) {
        let now = self.clock.now_ms();
        let (emits, started) = {
            let mut state = self.state.lock();
            let State::Active(active) = &mut *state else {
                return;
            };
            if now.saturating_sub(active.last_activity_ms) <= self.config.timeout_ms {
                return;
            }
            let mut emits = Vec::new();
            self.finalize(active, CloseReason::Timeout, now, &mut emits);
            let (next, mut start_emits) = self.open_session(now);
            let started = next.snapshot();
            emits.append(&mut start_emits);
            *state = State::Active(next);
            (emits, Some(started))
        };
        self.dispatch_emits(emits).await;
        if let Some(snapshot) = started {
            self.notify_started(&snapshot).await;
        }
    }

    /// Close the current session. A no-op when nothing is open, so exit
    /// handlers and timeout ticks can race without double-emitting
    /// `session_end`.
    pub async fn close(&self, reason: CloseReason) {
        let now = self.clock.now_ms();
        let emits = {
            let mut state = self.state.lock();
            let State::Active(active) = &mut *state else {
                return;
            };
            let mut emits = Vec::new();
            self.finalize(active, reason, now, &mut emits);
            *state = State::Closed;
            emits
        };
        self.dispatch_emits(emits).await;
    }

    /// Snapshot of the open session, if any.
    pub fn current(&self) -> Option<SessionSnapshot> {
        match &*self.state.lock() {
            State::Active(active) => Some(active.snapshot()),
            _ => None,
        }
    }

    /// Long-run statistics as persisted after the last close.
    pub fn stats(&self) -> SessionStats {
        self.store.get_json(keys::STATS).unwrap_or_default()
    }

    fn open_session(&self, now: u64) -> (ActiveSession, Vec<Emit>) {
        let number = self.store.get_u64(keys::SESSION_NUMBER).unwrap_or(0) + 1;
        let active = ActiveSession {
            id: SessionId::allocate(now),
            number,
            start_ms: now,
            last_activity_ms: now,
            interaction_count: 0,
            engaged: false,
            restored: false,
        };
        self.persist(&active);
        let mut props = self.session_props(&active, now);
        for (key, value) in &self.context {
            props.entry(key.clone()).or_insert(value.clone());
        }
        info!(session_id = %active.id, number, "session started");
        (active, vec![Emit::Track("session_start", props)])
    }

    fn finalize(
        &self,
        active: &ActiveSession,
        reason: CloseReason,
        now: u64,
        emits: &mut Vec<Emit>,
    ) {
        let duration_ms = now.saturating_sub(active.start_ms);
        let mut stats: SessionStats = self.store.get_json(keys::STATS).unwrap_or_default();
        stats.absorb(duration_ms, active.engaged);
        self.store.set_json(keys::STATS, &stats);

        let mut props = self.session_props(active, now);
        props.insert("session_duration_ms".into(), json!(duration_ms));
        props.insert("close_reason".into(), json!(reason.label()));
        emits.push(Emit::Track("session_end", props));
        info!(
            session_id = %active.id,
            duration_ms,
            reason = reason.label(),
            "session ended"
        );
    }

    fn session_props(&self, active: &ActiveSession, now: u64) -> Map<String, Value> {
        let mut props = Map::new();
        // Wire contract: ids cross as strings even though stored numeric.
        props.insert("session_id".into(), json!(active.id.to_string()));
        props.insert("session_number".into(), json!(active.number));
        props.insert("is_engaged".into(), json!(active.engaged));
        props.insert("interaction_count".into(), json!(active.interaction_count));
        props.insert("event_time".into(), json!(format_event_time(now)));
        props
    }

    fn persist(&self, active: &ActiveSession) {
        self.store.set_u64(keys::SESSION_ID, active.id.0);
        self.store.set_u64(keys::SESSION_NUMBER, active.number);
        self.store.set_u64(keys::SESSION_START, active.start_ms);
        self.store.set_u64(keys::LAST_ACTIVITY, active.last_activity_ms);
        self.store.set_bool(keys::ENGAGED, active.engaged);
        self.store.set_u64(keys::INTERACTIONS, active.interaction_count);
    }

    fn read_persisted(&self) -> Option<PersistedSession> {
        Some(PersistedSession {
            id: SessionId(self.store.get_u64(keys::SESSION_ID)?),
            number: self.store.get_u64(keys::SESSION_NUMBER)?,
            start_ms: self.store.get_u64(keys::SESSION_START)?,
            last_activity_ms: self.store.get_u64(keys::LAST_ACTIVITY)?,
            engaged: self.store.get_bool(keys::ENGAGED).unwrap_or(false),
            interaction_count: self.store.get_u64(keys::INTERACTIONS).unwrap_or(0),
        })
    }

    async fn dispatch_emits(&self, emits: Vec<Emit>) {
        for emit in emits {
            match emit {
                Emit::Track(event, props) => self.dispatcher.track(event, props).await,
            }
        }
    }

    async fn notify_started(&self, snapshot: &SessionSnapshot) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.session_started(snapshot).await;
        }
    }
}

struct PersistedSession {
    id: SessionId,
    number: u64,
    start_ms: u64,
    last_activity_ms: u64,
    engaged: bool,
    interaction_count: u64,
}

/// Spawn the fixed-interval timeout poll. Worst-case detection latency is
/// one interval; the loop never closes a session twice.
pub fn run_timeout_loop(engine: Arc<SessionEngine>) -> tokio::task::JoinHandle<()> {
    let period = std::time::Duration::from_millis(engine.config.check_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            engine.check_timeout().await;
        }
    })
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
        engine: Arc<SessionEngine>,
    }

    fn harness(config: SessionConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryStore::new());
        let sink = RecordingSink::new();
        let dispatcher = Dispatcher::with_sink(sink.clone());
        let engine = SessionEngine::new(config, clock.clone(), store.clone(), dispatcher);
        Harness {
            clock,
            store,
            sink,
            engine,
        }
    }

    #[tokio::test]
    async fn fresh_visitor_starts_session_number_one() {
        let h = harness(SessionConfig::default());
        let outcome = h.engine.initialize().await;
        let InitOutcome::New(snapshot) = outcome else {
            panic!("expected new session, got {outcome:?}");
        };
        assert_eq!(snapshot.number, 1);
        assert!(!snapshot.engaged);
        assert_eq!(snapshot.interaction_count, 0);

        let starts = h.sink.tracked("session_start");
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0]["session_number"], serde_json::json!(1));
        assert_eq!(
            starts[0]["session_id"],
            serde_json::json!(snapshot.id.to_string())
        );
    }

    #[tokio::test]
    async fn restore_within_timeout_preserves_identity() {
        let h = harness(SessionConfig::default());
        let InitOutcome::New(first) = h.engine.initialize().await else {
            panic!("expected new session");
        };

        // Simulate a reload five minutes later on the same store.
        h.clock.advance(5 * 60 * 1000);
        let sink = RecordingSink::new();
        let engine = SessionEngine::new(
            SessionConfig::default(),
            h.clock.clone(),
            h.store.clone(),
            Dispatcher::with_sink(sink.clone()),
        );
        let outcome = engine.initialize().await;
        let InitOutcome::Restored(snapshot) = outcome else {
            panic!("expected restored session, got {outcome:?}");
        };
        assert_eq!(snapshot.id, first.id);
        assert_eq!(snapshot.number, first.number);
        assert!(sink.tracked("session_start").is_empty());
    }

    #[tokio::test]
    async fn stale_storage_starts_new_session() {
        let h = harness(SessionConfig::default());
        let InitOutcome::New(first) = h.engine.initialize().await else {
            panic!("expected new session");
        };

        h.clock.advance(31 * 60 * 1000);
        let engine = SessionEngine::new(
            SessionConfig::default(),
            h.clock.clone(),
            h.store.clone(),
            Dispatcher::with_sink(RecordingSink::new()),
        );
        let InitOutcome::New(second) = engine.initialize().await else {
            panic!("expected new session after timeout");
        };
        assert_ne!(second.id, first.id);
        assert_eq!(second.number, first.number + 1);
        assert_eq!(second.interaction_count, 0);
    }

    #[tokio::test]
    async fn interaction_count_is_monotonic_and_exact() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        for _ in 0..5 {
            h.engine.record_activity().await;
        }
        let snapshot = h.engine.current().expect("active session");
        assert_eq!(snapshot.interaction_count, 5);
    }

    #[tokio::test]
    async fn engagement_promotes_once_by_interactions() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        h.engine.record_activity().await;
        assert!(h.sink.tracked("session_engaged").is_empty());
        h.engine.record_activity().await;
        let engaged = h.sink.tracked("session_engaged");
        assert_eq!(engaged.len(), 1);
        assert_eq!(
            engaged[0]["engagement_reason"],
            serde_json::json!("interaction_based")
        );

        // Further activity never re-emits.
        for _ in 0..10 {
            h.engine.record_activity().await;
        }
        assert_eq!(h.sink.tracked("session_engaged").len(), 1);
    }

    #[tokio::test]
    async fn engagement_promotes_by_dwell_time() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        h.clock.advance(10_000);
        h.engine.record_activity().await;
        let engaged = h.sink.tracked("session_engaged");
        assert_eq!(engaged.len(), 1);
        assert_eq!(
            engaged[0]["engagement_reason"],
            serde_json::json!("time_based")
        );
    }

    #[tokio::test]
    async fn timeout_closes_once_and_opens_next() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        let first = h.engine.current().expect("active");

        h.clock.advance(31 * 60 * 1000);
        h.engine.check_timeout().await;
        // Repeated ticks must not close again.
        h.engine.check_timeout().await;
        h.engine.check_timeout().await;

        let ends = h.sink.tracked("session_end");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0]["close_reason"], serde_json::json!("timeout"));

        let second = h.engine.current().expect("replacement session");
        assert_eq!(second.number, first.number + 1);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        h.clock.advance(2_000);
        h.engine.close(CloseReason::PageExit).await;
        h.engine.close(CloseReason::PageExit).await;
        h.engine.close(CloseReason::Manual).await;

        let ends = h.sink.tracked("session_end");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0]["session_duration_ms"], serde_json::json!(2_000));

        let stats = h.engine.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max_duration_ms, 2_000);
        assert_eq!(stats.avg_duration_ms, 2_000);
    }

    #[tokio::test]
    async fn stats_accumulate_across_sessions() {
        let config = SessionConfig::default();
        let h = harness(config.clone());
        h.engine.initialize().await;
        h.engine.record_activity().await;
        h.engine.record_activity().await; // engaged
        h.clock.advance(4_000);
        h.engine.close(CloseReason::PageExit).await;

        let engine = SessionEngine::new(
            config,
            h.clock.clone(),
            h.store.clone(),
            Dispatcher::with_sink(RecordingSink::new()),
        );
        engine.initialize().await;
        h.clock.advance(10_000);
        engine.close(CloseReason::Manual).await;

        let stats = engine.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.engaged_count, 1);
        assert_eq!(stats.total_duration_ms, 14_000);
        assert_eq!(stats.avg_duration_ms, 7_000);
        assert_eq!(stats.max_duration_ms, 10_000);
    }

    #[tokio::test]
    async fn touch_refreshes_idle_clock_without_interaction() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        h.clock.advance(29 * 60 * 1000);
        h.engine.touch();
        h.clock.advance(2 * 60 * 1000);
        // 31 minutes since start but only 2 since the touch.
        h.engine.check_timeout().await;
        assert!(h.sink.tracked("session_end").is_empty());
        assert_eq!(h.engine.current().expect("still open").interaction_count, 0);
    }

    #[tokio::test]
    async fn session_start_precedes_engagement_events() {
        let h = harness(SessionConfig::default());
        h.engine.initialize().await;
        h.engine.record_activity().await;
        h.engine.record_activity().await;
        let calls = h.sink.calls();
        let start_pos = calls
            .iter()
            .position(|call| matches!(call, SinkCall::Track { event, .. } if event == "session_start"))
            .expect("session_start present");
        let engaged_pos = calls
            .iter()
            .position(|call| matches!(call, SinkCall::Track { event, .. } if event == "session_engaged"))
            .expect("session_engaged present");
        assert!(start_pos < engaged_pos);
    }
}
