//! Persistence and HTTP fetch utilities for Integobase.
//!
//! `http` holds the rate-limited, retrying fetcher every source client sits
//! on; `store` defines the transactional store contract with an in-memory and
//! a Postgres implementation.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{BatchReceipt, EntityPage, EntityWrite, RunFilter, StoreError, SyncStore};
