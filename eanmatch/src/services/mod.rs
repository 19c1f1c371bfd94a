//! Service layer: catalog source adapters, matching, pack-size extraction

pub mod catalog;
pub mod fallback_client;
pub mod matcher;
pub mod pack_size;
pub mod primary_client;

pub use catalog::{CatalogSource, RetryPolicy, SourceError, SourceResponse};
pub use fallback_client::FallbackClient;
pub use matcher::{Matcher, SourceOutcome};
pub use primary_client::PrimaryClient;
