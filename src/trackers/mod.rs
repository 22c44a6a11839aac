//! Per-category event trackers.
//!
//! Each tracker consumes normalized page events for one interaction
//! category, classifies them against its config table, and feeds the
//! dispatch facade, the session engine and the attribute aggregator.
//! Trackers never return errors: a record that cannot be classified is
//! logged and dropped.

pub mod click;
pub mod exit;
pub mod form;
pub mod page_view;
pub mod popup;
pub mod resource;
pub mod scroll;
pub mod video;

pub use click::{ClickCategory, ClickTracker};
pub use exit::ExitTracker;
pub use form::FormTracker;
pub use page_view::PageViewTracker;
pub use popup::PopupTracker;
pub use resource::ResourceTracker;
pub use scroll::ScrollTracker;
pub use video::VideoTracker;
