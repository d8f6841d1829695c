//! Schedule store abstraction
//!
//! The sweeper only talks to persistence through [`ScheduleStore`]. The
//! SQLite-backed [`crate::db::Database`] is the production implementation.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Account, Cast, CastStatus, Media};

/// Column updates that accompany a status change.
///
/// Each variant is only valid with one target status; the store rejects
/// mismatched combinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionFields {
    /// `scheduled -> publishing`. `parent_hash`, when set, replaces the stored
    /// reply target (thread members resolved during the sweep).
    Claim {
        token: String,
        parent_hash: Option<String>,
    },
    /// `publishing -> published`
    Published {
        cast_hash: String,
        claim_token: Option<String>,
    },
    /// `publishing -> failed`; increments `retry_count`
    Failed {
        error_message: String,
        claim_token: Option<String>,
    },
    /// `failed|scheduled|draft -> scheduled`
    Requeue {
        scheduled_at: i64,
        reset_retries: bool,
    },
}

impl TransitionFields {
    /// The only status these fields may be written with.
    pub fn target_status(&self) -> CastStatus {
        match self {
            TransitionFields::Claim { .. } => CastStatus::Publishing,
            TransitionFields::Published { .. } => CastStatus::Published,
            TransitionFields::Failed { .. } => CastStatus::Failed,
            TransitionFields::Requeue { .. } => CastStatus::Scheduled,
        }
    }
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Casts with `status = scheduled` and `scheduled_at <= now`, oldest
    /// first, thread members in `thread_order`.
    async fn find_due_casts(&self, now: i64, limit: Option<usize>) -> Result<Vec<Cast>>;

    /// Media for a cast ordered by `sort_order`.
    async fn find_media_for_cast(&self, cast_id: &str) -> Result<Vec<Media>>;

    /// Atomically move a cast from `expected` to `new`.
    ///
    /// Returns `Ok(false)` when the row is no longer in `expected` (or the
    /// claim token no longer matches), which callers treat as "someone else
    /// owns this cast".
    async fn compare_and_set_status(
        &self,
        cast_id: &str,
        expected: CastStatus,
        new: CastStatus,
        fields: TransitionFields,
        now: i64,
    ) -> Result<bool>;

    async fn get_cast(&self, cast_id: &str) -> Result<Option<Cast>>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>>;

    /// The thread member with the next-lower `thread_order`, if any.
    async fn find_thread_predecessor(&self, thread_id: &str, thread_order: i64) -> Result<Option<Cast>>;

    /// Casts stuck in `publishing` with `claimed_at < claimed_before`.
    async fn find_stale_publishing(&self, claimed_before: i64) -> Result<Vec<Cast>>;

    /// Failed casts with `retry_count < max_retry_count`.
    async fn find_requeueable_failed(&self, max_retry_count: i64) -> Result<Vec<Cast>>;
}

#[async_trait]
impl<T: ScheduleStore + ?Sized> ScheduleStore for Arc<T> {
    async fn find_due_casts(&self, now: i64, limit: Option<usize>) -> Result<Vec<Cast>> {
        (**self).find_due_casts(now, limit).await
    }

    async fn find_media_for_cast(&self, cast_id: &str) -> Result<Vec<Media>> {
        (**self).find_media_for_cast(cast_id).await
    }

    async fn compare_and_set_status(
        &self,
        cast_id: &str,
        expected: CastStatus,
        new: CastStatus,
        fields: TransitionFields,
        now: i64,
    ) -> Result<bool> {
        (**self)
            .compare_and_set_status(cast_id, expected, new, fields, now)
            .await
    }

    async fn get_cast(&self, cast_id: &str) -> Result<Option<Cast>> {
        (**self).get_cast(cast_id).await
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        (**self).get_account(account_id).await
    }

    async fn find_thread_predecessor(&self, thread_id: &str, thread_order: i64) -> Result<Option<Cast>> {
        (**self).find_thread_predecessor(thread_id, thread_order).await
    }

    async fn find_stale_publishing(&self, claimed_before: i64) -> Result<Vec<Cast>> {
        (**self).find_stale_publishing(claimed_before).await
    }

    async fn find_requeueable_failed(&self, max_retry_count: i64) -> Result<Vec<Cast>> {
        (**self).find_requeueable_failed(max_retry_count).await
    }
}
