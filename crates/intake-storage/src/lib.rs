//! Raw payload archive, HTTP fetch utilities, and the data store client for the intake pipeline.

mod archive;
mod fetch;
mod memory;
mod postgres;
mod store;

pub use archive::{sha256_hex, ArchivedPayload, ArtifactStore};
pub use fetch::{
    is_retryable_status, FetchError, HttpClientConfig, HttpFetcher, HttpResponse, RateLimit, RateLimiter,
    RetryPolicy,
};
pub use intake_core::Row;
pub use memory::{MemoryStore, TableSpec};
pub use postgres::PgStore;
pub use store::{Condition, DataStore, Filter, StoreError};

pub const CRATE_NAME: &str = "intake-storage";
