//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::ParserConfigBuilder::progress_callback`] to receive
//! events as stages start and finish and as pages settle.
//!
//! # Why callbacks instead of channels?
//!
//! A callback lets the host forward events anywhere (a progress bar, a
//! broadcast channel, a job table) without the library knowing how the host
//! communicates. The trait is `Send + Sync` because per-page events fire from
//! concurrently running page tasks.

use crate::context::Status;
use std::sync::Arc;

/// Called by [`crate::pipeline::Pipeline`] and the per-page stages.
///
/// All methods default to no-ops so implementors override only what they
/// need. `on_page_complete` may be called concurrently from different tasks.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the first stage runs.
    fn on_pipeline_start(&self, pipeline: &str, stage_count: usize) {
        let _ = (pipeline, stage_count);
    }

    fn on_stage_start(&self, stage: &str) {
        let _ = stage;
    }

    fn on_stage_complete(&self, stage: &str, elapsed_ms: u64) {
        let _ = (stage, elapsed_ms);
    }

    /// Called when a per-page stage has finished with one page.
    ///
    /// # Arguments
    /// * `stage`      — stage that processed the page
    /// * `page_index` — 0-based page index
    /// * `status`     — page status after the stage
    fn on_page_complete(&self, stage: &str, page_index: usize, status: Status) {
        let _ = (stage, page_index, status);
    }

    /// Called once after the last stage, with the summed stage time.
    fn on_pipeline_complete(&self, pipeline: &str, total_ms: u64) {
        let _ = (pipeline, total_ms);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ParserConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
