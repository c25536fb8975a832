//! Enrichment stages
//!
//! Each stage walks its rows one at a time, performs one kind of registry
//! lookup per row and reports per-row progress through a [`StageMeter`].
//! Row-skippable gateway failures are folded into the row's state; fatal
//! ones are returned and end the task.
//!
//! [`StageMeter`]: crate::progress::StageMeter

use crate::cache::LookupCache;
use crate::config::PayTypeTable;
use crate::gateway::{GatewayError, GatewayRequest, Lookup, RegistryGateway};
use std::sync::Arc;
use tracing::warn;

pub mod catalog;
pub mod classify;
pub mod fallback;
pub mod history;
pub mod identity;
pub mod payment;

pub use classify::{classify, Classification};

/// Shared collaborators of every stage
#[derive(Clone)]
pub struct StageContext {
    gateway: Arc<dyn RegistryGateway>,
    cache: Arc<LookupCache<Lookup>>,
    pay_types: PayTypeTable,
    history_window_days: i64,
}

impl StageContext {
    pub fn new(
        gateway: Arc<dyn RegistryGateway>,
        cache: Arc<LookupCache<Lookup>>,
        pay_types: PayTypeTable,
        history_window_days: i64,
    ) -> Self {
        Self {
            gateway,
            cache,
            pay_types,
            history_window_days,
        }
    }

    pub fn pay_types(&self) -> &PayTypeTable {
        &self.pay_types
    }

    pub fn history_window_days(&self) -> i64 {
        self.history_window_days
    }

    /// Memoized gateway call keyed by `(request.operation, key)`
    ///
    /// Row-skippable failures are remembered as [`Lookup::Skipped`] like any
    /// other answer; fatal failures are returned and never cached.
    pub async fn lookup(&self, request: GatewayRequest, key: &str) -> Result<Lookup, GatewayError> {
        let operation = request.operation;
        self.cache
            .get_or_try_compute(operation, key, || async {
                match self.gateway.call(&request).await {
                    Ok(value) => Ok(Lookup::Found(value)),
                    Err(e) if e.is_row_skippable() => {
                        warn!("Skipping {} lookup for key {}: {}", operation, key, e);
                        Ok(Lookup::Skipped {
                            reason: e.to_string(),
                        })
                    }
                    Err(e) => Err(e),
                }
            })
            .await
    }
}
