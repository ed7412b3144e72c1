//! Per-client token budget with a lazily rolled-over reset window.
//!
//! Rollover has no background timer: every [`UsageTracker::get_usage`],
//! [`UsageTracker::check_limit`] and [`UsageTracker::add_tokens`] call first
//! checks whether the client's window has elapsed and resets it if so.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::storage::{StorageError, UsageRecord, UsageStorage};

/// How far a stored `last_reset` may lie in the future before it is distrusted
const CLOCK_SKEW: TimeDelta = TimeDelta::minutes(5);

/// Usage for one client as seen from the current window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub period_tokens: u64,
    pub total_tokens: u64,
    pub token_limit: u64,
    pub tokens_remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl UsageSnapshot {
    /// Post-action flag: the budget has been reached or overshot.
    ///
    /// Uses `>=` while [`UsageTracker::check_limit`] admits on `<`; the two
    /// drive different behaviours (session teardown vs. pre-action denial).
    pub fn limit_exceeded(&self) -> bool {
        self.period_tokens >= self.token_limit
    }
}

pub struct UsageTracker {
    storage: Arc<dyn UsageStorage>,
    token_limit: u64,
    reset_period: TimeDelta,
    storage_timeout: Duration,
}

impl UsageTracker {
    pub fn new(
        storage: Arc<dyn UsageStorage>,
        token_limit: u64,
        reset_period: TimeDelta,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            token_limit,
            reset_period,
            storage_timeout,
        }
    }

    pub fn token_limit(&self) -> u64 {
        self.token_limit
    }

    pub fn reset_period(&self) -> TimeDelta {
        self.reset_period
    }

    /// Current usage, rolling the window over first if it has elapsed.
    pub async fn get_usage(&self, client_key: &str) -> Result<UsageSnapshot, StorageError> {
        let record = self.current_record(client_key).await?;
        Ok(self.snapshot(record, Utc::now()))
    }

    /// Admission gate: allowed while the period total is strictly below the limit.
    pub async fn check_limit(
        &self,
        client_key: &str,
    ) -> Result<(bool, UsageSnapshot), StorageError> {
        let snapshot = self.get_usage(client_key).await?;
        let allowed = snapshot.period_tokens < self.token_limit;

        if !allowed {
            warn!(
                "Token limit exceeded for {client_key}: {}/{} tokens used",
                snapshot.period_tokens, self.token_limit
            );
        }

        Ok((allowed, snapshot))
    }

    /// Record consumption after the fact. Never denies; `amount` is validated by the caller.
    pub async fn add_tokens(&self, client_key: &str, amount: u64) -> Result<(), StorageError> {
        self.current_record(client_key).await?;
        self.bounded(self.storage.increment_tokens(client_key, amount))
            .await?;
        debug!("Added {amount} tokens for {client_key}");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), StorageError> {
        self.storage.close().await
    }

    /// Whether the window that started at `last_reset` has elapsed by `now`.
    /// An unreadable `last_reset`, or one further ahead than [`CLOCK_SKEW`],
    /// always counts as elapsed.
    fn should_reset(&self, record: &UsageRecord, now: DateTime<Utc>) -> bool {
        match record.last_reset {
            Some(last_reset) if last_reset - now > CLOCK_SKEW => true,
            Some(last_reset) => now - last_reset >= self.reset_period,
            None => true,
        }
    }

    /// Read the record, resetting and re-reading it when its window has elapsed.
    async fn current_record(
        &self,
        client_key: &str,
    ) -> Result<Option<UsageRecord>, StorageError> {
        let record = self.bounded(self.storage.get_usage(client_key)).await?;

        match record {
            Some(ref r) if self.should_reset(r, Utc::now()) => {
                self.bounded(self.storage.reset_usage(client_key)).await?;
                info!("Reset usage for client {client_key}");
                self.bounded(self.storage.get_usage(client_key)).await
            }
            other => Ok(other),
        }
    }

    /// Absent records read as a fresh zero record whose window starts now.
    fn snapshot(&self, record: Option<UsageRecord>, now: DateTime<Utc>) -> UsageSnapshot {
        let (period_tokens, total_tokens, last_reset) = match record {
            Some(r) => (r.period_tokens, r.total_tokens, r.last_reset.unwrap_or(now)),
            None => (0, 0, now),
        };

        UsageSnapshot {
            period_tokens,
            total_tokens,
            token_limit: self.token_limit,
            tokens_remaining: self.token_limit.saturating_sub(period_tokens),
            reset_at: last_reset
                .checked_add_signed(self.reset_period)
                .unwrap_or(now + self.reset_period),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        tokio::time::timeout(self.storage_timeout, call)
            .await
            .map_err(|_| StorageError::Timeout(self.storage_timeout))?
    }
}
