//! URL handling module for Multicrawl
//!
//! This module provides URL normalization, site domain extraction and link
//! resolution. Normalized URLs are the identity of a record in the
//! incremental state, so the same listing card must always resolve to the same
//! string across crawls.

mod domain;
mod normalize;

// Re-export main functions
pub use domain::{extract_domain, site_domain};
pub use normalize::{normalize_url, resolve_link};
