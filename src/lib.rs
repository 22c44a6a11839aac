//! PagePulse runtime library.
//!
//! Exposes the config, tracker and runtime modules for integration
//! testing; the binary entry point lives in `main.rs`.

pub mod cli;
pub mod config;
pub mod runtime;
pub mod trackers;

pub use config::Config;
pub use runtime::{ensure_visitor_id, Runtime};
