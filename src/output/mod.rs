//! Output module for records and run reports
//!
//! This module handles:
//! - Handing new and updated records to the downstream sink
//! - Summarizing orchestrator runs per site
//! - Printing site, job and event listings for operators

mod report;
mod sink;

pub use report::{
    print_events, print_jobs, print_run_report, print_sites, RunOutcome, RunReport, SiteOutcome,
    SiteReport,
};
pub use sink::{ExtractedRecord, JsonLinesSink, MemorySink, RecordSink, SinkError};

use crate::config::SinkConfig;
use std::path::Path;

/// Opens the sink described by the configuration
///
/// # Arguments
///
/// * `config` - The sink configuration
///
/// # Returns
///
/// * `Ok(JsonLinesSink)` - The sink, ready to append
/// * `Err(SinkError)` - The output file could not be opened
pub async fn open_sink(config: &SinkConfig) -> Result<JsonLinesSink, SinkError> {
    JsonLinesSink::open(Path::new(&config.path)).await
}
