//! Gatehouse — a permission-gated resource API.
//!
//! Library crate so the binary and the integration tests in `tests/`
//! share the router, state, and domain modules.

pub mod api;
pub mod authz;
pub mod cli;
pub mod config;
pub mod entitlements;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pagination;
pub mod quota;
pub mod store;

use std::sync::Arc;

use entitlements::Entitlements;
use jobs::{DispatchMode, Dispatcher};
use metrics::UsageMetrics;
use middleware::rate_limit::RateLimiter;
use store::Store;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub store: Arc<Store>,
    pub entitlements: Entitlements,
    pub limiter: RateLimiter,
    pub jobs: Dispatcher,
    pub metrics: UsageMetrics,
    pub config: config::Config,
}

impl AppState {
    /// Must run inside a tokio runtime when `inline_jobs` is off (the
    /// dispatcher starts its worker task).
    pub fn new(config: config::Config) -> anyhow::Result<Arc<AppState>> {
        let store = Arc::new(Store::new());
        let mode = if config.inline_jobs {
            DispatchMode::Inline
        } else {
            DispatchMode::Spawn
        };
        Ok(Arc::new(AppState {
            jobs: Dispatcher::new(store.clone(), mode),
            store,
            entitlements: Entitlements::default(),
            limiter: RateLimiter::new(),
            metrics: UsageMetrics::new()?,
            config,
        }))
    }
}
