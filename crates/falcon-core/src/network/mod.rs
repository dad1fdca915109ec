//! HTTP plumbing shared by site clients and the download coordinator.

mod client;
mod retry;

pub use client::{extract_domain, HttpClient, HttpClientOptions, RateLimitState};
pub use retry::{retry_async, retry_async_with_hint, RetryConfig, RetryStats};
