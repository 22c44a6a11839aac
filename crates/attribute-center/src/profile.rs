//! Persistent visitor profile: cumulative counters, set-once facts and the
//! bookkeeping collections the classifiers derive labels from.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Maximum number of recently viewed pages kept in the profile.
pub const VIEWED_PAGES_CAP: usize = 20;

/// Depth bucket a page engagement event falls into.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthBucket {
    /// Short dwell, bounced or skimmed.
    Surface,
    /// Moderate dwell.
    Medium,
    /// Long dwell or full scroll reached.
    Deep,
}

impl DepthBucket {
    pub fn label(self) -> &'static str {
        match self {
            DepthBucket::Surface => "surface",
            DepthBucket::Medium => "medium",
            DepthBucket::Deep => "deep",
        }
    }
}

/// Cumulative profile of one visitor across sessions. Serialized wholesale
/// into the key-value store after every mutation batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitorProfile {
    // Monotonic counters.
    #[serde(default)]
    pub total_sessions: u64,
    #[serde(default)]
    pub total_form_submissions: u64,
    #[serde(default)]
    pub total_downloads: u64,
    #[serde(default)]
    pub total_scroll_depth_100: u64,
    #[serde(default)]
    pub popup_interactions: u64,
    #[serde(default)]
    pub external_link_clicks: u64,
    #[serde(default)]
    pub total_time_spent_secs: u64,

    // Section interest feeding the lifecycle classifier.
    #[serde(default)]
    pub company_section_views: u64,
    #[serde(default)]
    pub case_study_views: u64,

    // Set-once facts; never overwritten after the first write.
    #[serde(default)]
    pub first_visit_ms: Option<u64>,
    #[serde(default)]
    pub first_utm_source: Option<String>,
    #[serde(default)]
    pub first_referrer_domain: Option<String>,

    // Bookkeeping collections.
    #[serde(default)]
    pub viewed_pages: VecDeque<String>,
    #[serde(default)]
    pub traffic_sources_used: BTreeSet<String>,
    #[serde(default)]
    pub section_visits: BTreeMap<String, u64>,
    #[serde(default)]
    pub depth_table: BTreeMap<DepthBucket, u64>,

    // Last dispatched classification labels, kept so a reload round-trips
    // the derived state too.
    #[serde(default)]
    pub engagement_level: Option<String>,
    #[serde(default)]
    pub visitor_lifecycle_stage: Option<String>,
    #[serde(default)]
    pub interaction_frequency: Option<String>,
    #[serde(default)]
    pub content_depth_preference: Option<String>,
}

impl VisitorProfile {
    /// Push a viewed page, evicting the oldest entry beyond the cap.
    pub fn push_viewed_page(&mut self, url: &str) {
        if self.viewed_pages.len() == VIEWED_PAGES_CAP {
            self.viewed_pages.pop_front();
        }
        self.viewed_pages.push_back(url.to_string());
    }

    pub fn record_section_visit(&mut self, section: &str) {
        *self.section_visits.entry(section.to_string()).or_insert(0) += 1;
        match section {
            "company" => self.company_section_views += 1,
            "case_study" => self.case_study_views += 1,
            _ => {}
        }
    }

    pub fn record_depth(&mut self, bucket: DepthBucket) {
        *self.depth_table.entry(bucket).or_insert(0) += 1;
    }

    /// Argmax over the depth table; ties resolve to the deepest bucket so
    /// an even split never demotes an established preference.
    pub fn depth_preference(&self) -> Option<DepthBucket> {
        self.depth_table
            .iter()
            .max_by_key(|(bucket, count)| (**count, **bucket))
            .map(|(bucket, _)| *bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewed_pages_ring_is_capped() {
        let mut profile = VisitorProfile::default();
        for i in 0..25 {
            profile.push_viewed_page(&format!("/page-{i}"));
        }
        assert_eq!(profile.viewed_pages.len(), VIEWED_PAGES_CAP);
        assert_eq!(profile.viewed_pages.front().map(String::as_str), Some("/page-5"));
        assert_eq!(profile.viewed_pages.back().map(String::as_str), Some("/page-24"));
    }

    #[test]
    fn depth_preference_is_argmax_with_deep_tiebreak() {
        let mut profile = VisitorProfile::default();
        assert_eq!(profile.depth_preference(), None);
        profile.record_depth(DepthBucket::Surface);
        profile.record_depth(DepthBucket::Surface);
        profile.record_depth(DepthBucket::Deep);
        assert_eq!(profile.depth_preference(), Some(DepthBucket::Surface));
        profile.record_depth(DepthBucket::Deep);
        assert_eq!(profile.depth_preference(), Some(DepthBucket::Deep));
    }

    #[test]
    fn section_visits_feed_interest_counters() {
        let mut profile = VisitorProfile::default();
        profile.record_section_visit("company");
        profile.record_section_visit("case_study");
        profile.record_section_visit("blog");
        assert_eq!(profile.company_section_views, 1);
        assert_eq!(profile.case_study_views, 1);
        assert_eq!(profile.section_visits["blog"], 1);
    }

    #[test]
    fn profile_round_trips_through_json() {
        let mut profile = VisitorProfile::default();
        profile.total_sessions = 3;
        profile.first_utm_source = Some("newsletter".into());
        profile.push_viewed_page("/pricing");
        profile.traffic_sources_used.insert("google".into());
        profile.record_depth(DepthBucket::Medium);
        profile.engagement_level = Some("medium".into());

        let raw = serde_json::to_string(&profile).expect("serialize");
        let loaded: VisitorProfile = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(loaded, profile);
    }
}
