//! Collection runtime: wires the store, dispatch facade, session and
//! attribute engines and the per-category trackers, and routes
//! normalized page events to them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_core_types::{Clock, ManualClock, VisitorId};
use pagepulse_dispatch::Dispatcher;
use pagepulse_event_bus::{PageEvent, PageEventBus, PageEventKind};
use pagepulse_kv_store::KvBackend;
use pagepulse_session_center::{CloseReason, InitOutcome, SessionEngine};

use crate::config::{Config, ModulesConfig};
use crate::trackers::{
    ClickTracker, ExitTracker, FormTracker, PageViewTracker, PopupTracker, ResourceTracker,
    ScrollTracker, VideoTracker,
};

const VISITOR_ID_KEY: &str = "visitor_id";

/// Load the persistent visitor identity, minting one on first run.
pub fn ensure_visitor_id(store: &dyn KvBackend, clock: &dyn Clock) -> VisitorId {
    if let Some(existing) = store.get(VISITOR_ID_KEY) {
        return VisitorId(existing);
    }
    let minted = format!("v-{:x}", clock.now_ms());
    store.set(VISITOR_ID_KEY, &minted);
    info!(visitor_id = %minted, "minted new visitor id");
    VisitorId(minted)
}

pub struct Runtime {
    modules: ModulesConfig,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
    click: ClickTracker,
    scroll: ScrollTracker,
    form: FormTracker,
    popup: PopupTracker,
    resource: ResourceTracker,
    video: VideoTracker,
    page_view: Arc<PageViewTracker>,
    exit: ExitTracker,
    /// Present in replay mode so event timestamps drive the clock.
    replay_clock: Option<Arc<ManualClock>>,
}

impl Runtime {
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KvBackend>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Self::build(config, clock, store, dispatcher, None)
    }

    /// Replay-mode runtime: the supplied manual clock is advanced to
    /// each event's timestamp before the event is processed.
    pub fn for_replay(
        config: &Config,
        clock: Arc<ManualClock>,
        store: Arc<dyn KvBackend>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Self::build(
            config,
            clock.clone(),
            store,
            dispatcher,
            Some(clock),
        )
    }

    fn build(
        config: &Config,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KvBackend>,
        dispatcher: Arc<Dispatcher>,
        replay_clock: Option<Arc<ManualClock>>,
    ) -> Arc<Self> {
        let session = SessionEngine::new(
            config.session.clone(),
            clock.clone(),
            store.clone(),
            dispatcher.clone(),
        );
        let attributes = AttributeEngine::new(
            config.attributes.clone(),
            clock.clone(),
            store.clone(),
            dispatcher.clone(),
        );
        // New sessions bump total_sessions and reclassify the visitor.
        session.set_observer(attributes.clone());

        let page_view = PageViewTracker::new(
            &config.scroll,
            clock.clone(),
            dispatcher.clone(),
            session.clone(),
            attributes.clone(),
        );
        Arc::new(Self {
            modules: config.modules.clone(),
            click: ClickTracker::new(
                config.click.clone(),
                dispatcher.clone(),
                session.clone(),
                attributes.clone(),
            ),
            scroll: ScrollTracker::new(
                &config.scroll,
                dispatcher.clone(),
                session.clone(),
                attributes.clone(),
            ),
            form: FormTracker::new(
                config.form.clone(),
                dispatcher.clone(),
                session.clone(),
                attributes.clone(),
            ),
            popup: PopupTracker::new(dispatcher.clone(), session.clone(), attributes.clone()),
            resource: ResourceTracker::new(
                &config.click,
                dispatcher.clone(),
                session.clone(),
                attributes.clone(),
            ),
            video: VideoTracker::new(dispatcher, session.clone()),
            exit: ExitTracker::new(session.clone(), attributes.clone(), page_view.clone()),
            page_view,
            session,
            attributes,
            replay_clock,
        })
    }

    pub fn session(&self) -> &Arc<SessionEngine> {
        &self.session
    }

    pub fn attributes(&self) -> &Arc<AttributeEngine> {
        &self.attributes
    }

    /// Restore or open the visitor session.
    pub async fn start(&self) -> InitOutcome {
        self.session.initialize().await
    }

    /// Route one normalized event to its tracker, honoring the module
    /// switches.
    pub async fn process(&self, event: &PageEvent) {
        if let (Some(clock), Some(at_ms)) = (&self.replay_clock, event.at_ms) {
            clock.set(at_ms);
            self.session.check_timeout().await;
        }
        match &event.kind {
            PageEventKind::PageView {
                url,
                title,
                referrer,
                utm_source,
            } => {
                if self.modules.page_view {
                    self.scroll.reset_page();
                    self.page_view
                        .handle(url, title, referrer, utm_source.as_deref())
                        .await;
                }
            }
            PageEventKind::Click {
                href,
                classes,
                text,
                element,
            } => {
                if self.modules.click {
                    self.click
                        .handle(href.as_deref(), classes, text, element)
                        .await;
                }
            }
            PageEventKind::Scroll { depth_percent } => {
                if self.modules.scroll {
                    self.scroll.handle(*depth_percent).await;
                }
            }
            PageEventKind::FormSubmit {
                form_id,
                field_count,
            } => {
                if self.modules.form {
                    self.form.handle(form_id, *field_count).await;
                }
            }
            PageEventKind::PopupShown { popup_id } => {
                if self.modules.popup {
                    self.popup.handle_shown(popup_id).await;
                }
            }
            PageEventKind::PopupInteraction { popup_id, action } => {
                if self.modules.popup {
                    self.popup.handle_interaction(popup_id, action).await;
                }
            }
            PageEventKind::ResourceAccess { url } => {
                if self.modules.resource {
                    self.resource.handle(url).await;
                }
            }
            PageEventKind::Video {
                action,
                video_id,
                position_secs,
            } => {
                if self.modules.video {
                    self.video.handle(*action, video_id, *position_secs).await;
                }
            }
            PageEventKind::VisibilityHidden => {
                if self.modules.exit {
                    self.exit.handle_hidden().await;
                }
            }
            PageEventKind::PageExit { exit } => {
                if self.modules.exit {
                    self.exit.handle_exit(*exit).await;
                }
            }
            PageEventKind::BfCacheRestore => {
                self.exit.handle_restore();
            }
        }
    }

    /// Consume events from the bus until it closes.
    pub fn attach(self: &Arc<Self>, bus: &Arc<PageEventBus>) -> JoinHandle<()> {
        let runtime = self.clone();
        let mut events = pagepulse_event_bus::to_mpsc(bus.clone(), 256);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                runtime.process(&event).await;
            }
            debug!("event bus closed, runtime detaching");
        })
    }

    /// Feed a JSON event log through the trackers, in file order.
    pub async fn replay_file(&self, path: &Path) -> Result<usize> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let events: Vec<PageEvent> =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        for event in &events {
            self.process(event).await;
        }
        Ok(events.len())
    }

    /// Best-effort teardown for a runtime whose event source ended
    /// without an explicit exit record.
    pub async fn shutdown(&self) {
        self.page_view.page_closing().await;
        self.session.close(CloseReason::Manual).await;
        self.attributes.flush_now().await;
    }
}
