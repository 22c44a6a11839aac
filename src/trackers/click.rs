//! Click classification over the configured pattern tables.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use pagepulse_attribute_center::AttributeEngine;
use pagepulse_dispatch::Dispatcher;
use pagepulse_session_center::SessionEngine;

use crate::config::ClickRules;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClickCategory {
    Download,
    ExternalLink,
    Cta,
    Navigation,
    Generic,
}

impl ClickCategory {
    pub fn label(self) -> &'static str {
        match self {
            ClickCategory::Download => "download",
            ClickCategory::ExternalLink => "external_link",
            ClickCategory::Cta => "cta",
            ClickCategory::Navigation => "navigation",
            ClickCategory::Generic => "generic",
        }
    }
}

impl ClickRules {
    /// Classification precedence: download beats external link beats CTA
    /// beats navigation. A link can match several tables; the strongest
    /// signal wins.
    pub fn classify(&self, href: Option<&str>, classes: &[String]) -> ClickCategory {
        if let Some(href) = href {
            if let Some(extension) = url_extension(href) {
                if self
                    .download_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(extension))
                {
                    return ClickCategory::Download;
                }
            }
            if let Some(host) = url_host(href) {
                if !self
                    .internal_hosts
                    .iter()
                    .any(|internal| internal.eq_ignore_ascii_case(host))
                {
                    return ClickCategory::ExternalLink;
                }
            }
        }
        if classes.iter().any(|class| self.cta_classes.contains(class)) {
            return ClickCategory::Cta;
        }
        if classes.iter().any(|class| self.nav_classes.contains(class)) {
            return ClickCategory::Navigation;
        }
        ClickCategory::Generic
    }
}

/// File extension of a URL path, ignoring query and fragment.
pub fn url_extension(url: &str) -> Option<&str> {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    match path.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => Some(extension),
        _ => None,
    }
}

/// Host of an absolute http(s) URL; relative URLs have no host and are
/// treated as internal.
pub fn url_host(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    (!host.is_empty()).then_some(host)
}

pub struct ClickTracker {
    rules: ClickRules,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionEngine>,
    attributes: Arc<AttributeEngine>,
}

impl ClickTracker {
    pub fn new(
        rules: ClickRules,
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

    pub async fn handle(&self, href: Option<&str>, classes: &[String], text: &str, element: &str) {
        let category = self.rules.classify(href, classes);
        debug!(category = category.label(), ?href, "click classified");

        self.session.record_activity().await;
        match category {
            ClickCategory::Download => self.attributes.record_download().await,
            ClickCategory::ExternalLink => self.attributes.record_external_link_click().await,
            _ => {}
        }

        let mut props = Map::new();
        props.insert("category".into(), json!(category.label()));
        if let Some(href) = href {
            props.insert("href".into(), json!(href));
        }
        if !text.is_empty() {
            props.insert("text".into(), json!(text));
        }
        if !element.is_empty() {
            props.insert("element".into(), json!(element));
        }
        self.dispatcher.track("click", props).await;
    }
}
