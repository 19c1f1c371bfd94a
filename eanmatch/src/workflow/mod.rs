//! Batch workflow: the per-record pipeline and worker pool

pub mod pipeline;

pub use pipeline::{BatchSummary, Pipeline, RecordOutcome};
