//! Pure classification functions over profile counters.
//!
//! Every function here is deterministic in its inputs and recomputed from
//! scratch on each relevant mutation; nothing is incrementally adjusted.

use crate::profile::VisitorProfile;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    pub fn label(self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleStage {
    Awareness,
    Consideration,
    Decision,
}

impl LifecycleStage {
    pub fn label(self) -> &'static str {
        match self {
            LifecycleStage::Awareness => "awareness",
            LifecycleStage::Consideration => "consideration",
            LifecycleStage::Decision => "decision",
        }
    }
}

/// Weighted engagement score. Session count is capped at 100 points and
/// time spent at 200 points so long-lived visitors cannot saturate the
/// behavioral signals.
pub fn engagement_score(p: &VisitorProfile) -> u64 {
    50 * p.total_form_submissions
        + 30 * p.total_downloads
        + 15 * p.total_scroll_depth_100
        + 10 * p.popup_interactions
        + 5 * p.external_link_clicks
        + (10 * p.total_sessions).min(100)
        + (p.total_time_spent_secs / 60).min(200)
}

pub fn engagement_level(score: u64) -> Level {
    if score >= 200 {
        Level::High
    } else if score >= 50 {
        Level::Medium
    } else {
        Level::Low
    }
}

/// Interactions per session, floored at one session.
pub fn interaction_frequency(p: &VisitorProfile) -> Level {
    let interactions = p.total_form_submissions
        + p.total_downloads
        + p.popup_interactions
        + p.external_link_clicks;
    let per_session = interactions as f64 / p.total_sessions.max(1) as f64;
    if per_session >= 3.0 {
        Level::High
    } else if per_session >= 1.0 {
        Level::Medium
    } else {
        Level::Low
    }
}

/// Funnel stage. The check order is a deliberate precedence: decision
/// overrides consideration overrides awareness. Never reorder.
pub fn lifecycle_stage(p: &VisitorProfile) -> LifecycleStage {
    if p.total_form_submissions > 0 || p.company_section_views >= 2 || p.case_study_views >= 2 {
        LifecycleStage::Decision
    } else if p.total_sessions >= 3
        || p.total_downloads > 0
        || p.company_section_views > 0
        || p.case_study_views > 0
    {
        LifecycleStage::Consideration
    } else {
        LifecycleStage::Awareness
    }
}
