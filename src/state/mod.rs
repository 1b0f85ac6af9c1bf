//! State module for tracking site health and record changes
//!
//! # Components
//!
//! - `SiteStatus`: the persisted health status of a site and its transitions
//! - `SiteHealth`: per-job tracker that turns classified responses into status
//!   changes and delay adjustments
//! - `incremental`: record fingerprints, change detection and removal sweeps

pub mod incremental;
mod site_health;
mod site_status;

// Re-export main types
pub use incremental::{content_hash, ChangeKind};
pub use site_health::{settle_attempt, SiteHealth, Transition};
pub use site_status::{SiteStatus, StatusSignal};
