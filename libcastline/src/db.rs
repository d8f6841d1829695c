//! Database operations for Castline

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CastlineError, DbError, Result};
use crate::store::{ScheduleStore, TransitionFields};
use crate::types::{Account, Cast, CastMetadata, CastStatus, Media, MediaType, SignerStatus};

const CAST_COLUMNS: &str = "id, account_id, content, status, scheduled_at, channel_id, \
    parent_hash, thread_id, thread_order, cast_hash, published_at, error_message, retry_count, \
    created_by_id, metadata, created_at, updated_at, claimed_at, claim_token";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
            }
        }

        // WAL plus a busy timeout lets overlapping sweeps queue on the write
        // lock instead of failing with SQLITE_BUSY
        let options = SqliteConnectOptions::new()
            .filename(&expanded_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    /// Underlying pool, for ad-hoc queries in tools and tests
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a cast as written by a composer.
    ///
    /// No time check is made here; the future-time rule applies to the
    /// `draft -> scheduled` transition in [`Database::schedule_cast`].
    pub async fn create_cast(&self, cast: &Cast) -> Result<()> {
        if cast.status != CastStatus::Draft && cast.content.trim().is_empty() {
            return Err(CastlineError::InvalidInput(
                "Only drafts may have empty content".to_string(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO casts (
                id, account_id, content, status, scheduled_at, channel_id, parent_hash,
                thread_id, thread_order, cast_hash, published_at, error_message, retry_count,
                created_by_id, metadata, created_at, updated_at, claimed_at, claim_token
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cast.id)
        .bind(&cast.account_id)
        .bind(&cast.content)
        .bind(cast.status.as_str())
        .bind(cast.scheduled_at)
        .bind(&cast.channel_id)
        .bind(&cast.parent_hash)
        .bind(&cast.thread_id)
        .bind(cast.thread_order)
        .bind(&cast.cast_hash)
        .bind(cast.published_at)
        .bind(&cast.error_message)
        .bind(cast.retry_count)
        .bind(&cast.created_by_id)
        .bind(cast.metadata.to_stored())
        .bind(cast.created_at)
        .bind(cast.updated_at)
        .bind(cast.claimed_at)
        .bind(&cast.claim_token)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Attach a media row to an existing cast
    pub async fn attach_media(&self, media: &Media) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cast_media (id, cast_id, url, media_type, sort_order, video_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&media.id)
        .bind(&media.cast_id)
        .bind(&media.url)
        .bind(media.media_type.as_str())
        .bind(media.sort_order)
        .bind(&media.video_status)
        .bind(media.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Insert or replace an account
    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO accounts (id, fid, username, signer_token, signer_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                fid = excluded.fid,
                username = excluded.username,
                signer_token = excluded.signer_token,
                signer_status = excluded.signer_status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.id)
        .bind(account.fid)
        .bind(&account.username)
        .bind(account.signer_token.expose_secret())
        .bind(account.signer_status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Update an account's signer status (written by the external approval flow)
    pub async fn set_signer_status(&self, account_id: &str, status: SignerStatus) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET signer_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(CastlineError::NotFound(format!("account {}", account_id)));
        }
        Ok(())
    }

    /// `draft -> scheduled`. Requires content and a time after `now`.
    pub async fn schedule_cast(&self, cast_id: &str, at: i64, now: i64) -> Result<()> {
        let cast = self.require_cast(cast_id).await?;
        if cast.content.trim().is_empty() {
            return Err(CastlineError::InvalidInput(
                "Cannot schedule a cast with empty content".to_string(),
            ));
        }
        self.requeue(&cast, CastStatus::Draft, at, now, false).await
    }

    /// Move a `scheduled` or `failed` cast to a new future time.
    ///
    /// This is the explicit reschedule action, so `retry_count` is reset.
    pub async fn reschedule_cast(&self, cast_id: &str, at: i64, now: i64) -> Result<()> {
        let cast = self.require_cast(cast_id).await?;
        let from = match cast.status {
            CastStatus::Scheduled | CastStatus::Failed => cast.status,
            other => {
                return Err(CastlineError::InvalidTransition {
                    cast_id: cast_id.to_string(),
                    from: other,
                    to: CastStatus::Scheduled,
                })
            }
        };
        self.requeue(&cast, from, at, now, true).await
    }

    /// Send a `failed` cast around again at `at`, keeping its retry count.
    pub async fn retry_cast(&self, cast_id: &str, at: i64, now: i64) -> Result<()> {
        let cast = self.require_cast(cast_id).await?;
        self.requeue(&cast, CastStatus::Failed, at, now, false).await
    }

    async fn requeue(&self, cast: &Cast, from: CastStatus, at: i64, now: i64, reset_retries: bool) -> Result<()> {
        if at <= now {
            return Err(CastlineError::InvalidInput(format!(
                "Scheduled time must be in the future (got {}, now {})",
                at, now
            )));
        }
        if cast.status != from {
            return Err(CastlineError::InvalidTransition {
                cast_id: cast.id.clone(),
                from: cast.status,
                to: CastStatus::Scheduled,
            });
        }

        let fields = TransitionFields::Requeue {
            scheduled_at: at,
            reset_retries,
        };
        if !self
            .compare_and_set_status(&cast.id, from, CastStatus::Scheduled, fields, now)
            .await?
        {
            // Lost a race with a sweep or another operator
            let current = self.require_cast(&cast.id).await?;
            return Err(CastlineError::InvalidTransition {
                cast_id: cast.id.clone(),
                from: current.status,
                to: CastStatus::Scheduled,
            });
        }
        Ok(())
    }

    async fn require_cast(&self, cast_id: &str) -> Result<Cast> {
        self.get_cast(cast_id)
            .await?
            .ok_or_else(|| CastlineError::NotFound(cast_id.to_string()))
    }

    /// List casts, optionally filtered by status, soonest first
    pub async fn list_casts(&self, status: Option<CastStatus>, limit: usize) -> Result<Vec<Cast>> {
        let query_str = format!(
            r#"
            SELECT {}
            FROM casts
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY scheduled_at ASC, created_at ASC
            LIMIT ?2
            "#,
            CAST_COLUMNS
        );

        let rows = sqlx::query(&query_str)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(cast_from_row).collect()
    }

    /// Number of casts in each status (statuses with no casts report 0)
    pub async fn count_by_status(&self) -> Result<Vec<(CastStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM casts GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        Ok(CastStatus::ALL
            .iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|(s, _)| s == status.as_str())
                    .map(|(_, c)| *c)
                    .unwrap_or(0);
                (*status, count)
            })
            .collect())
    }

    async fn fetch_casts<'q>(&self, query: Query<'q, Sqlite, SqliteArguments<'q>>) -> Result<Vec<Cast>> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(cast_from_row).collect()
    }
}

#[async_trait]
impl ScheduleStore for Database {
    async fn find_due_casts(&self, now: i64, limit: Option<usize>) -> Result<Vec<Cast>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM casts
            WHERE status = 'scheduled' AND scheduled_at <= ?
            ORDER BY scheduled_at ASC, thread_id ASC, thread_order ASC, created_at ASC
            LIMIT ?
            "#,
            CAST_COLUMNS
        );
        // SQLite treats a negative LIMIT as "no limit"
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.fetch_casts(sqlx::query(&sql).bind(now).bind(limit)).await
    }

    async fn find_media_for_cast(&self, cast_id: &str) -> Result<Vec<Media>> {
        let rows = sqlx::query(
            r#"
            SELECT id, cast_id, url, media_type, sort_order, video_status, created_at
            FROM cast_media
            WHERE cast_id = ?
            ORDER BY sort_order ASC
            "#,
        )
        .bind(cast_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(media_from_row).collect()
    }

    async fn compare_and_set_status(
        &self,
        cast_id: &str,
        expected: CastStatus,
        new: CastStatus,
        fields: TransitionFields,
        now: i64,
    ) -> Result<bool> {
        if !expected.can_transition_to(new) {
            return Err(CastlineError::InvalidTransition {
                cast_id: cast_id.to_string(),
                from: expected,
                to: new,
            });
        }
        if fields.target_status() != new {
            return Err(CastlineError::InvalidInput(format!(
                "Transition fields for {} used with target status {}",
                fields.target_status(),
                new
            )));
        }

        let result = match fields {
            TransitionFields::Claim { token, parent_hash } => {
                sqlx::query(
                    r#"
                    UPDATE casts
                    SET status = ?, claim_token = ?, claimed_at = ?,
                        parent_hash = COALESCE(?, parent_hash), updated_at = ?
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(new.as_str())
                .bind(token)
                .bind(now)
                .bind(parent_hash)
                .bind(now)
                .bind(cast_id)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await
            }
            TransitionFields::Published {
                cast_hash,
                claim_token,
            } => {
                sqlx::query(
                    r#"
                    UPDATE casts
                    SET status = ?, cast_hash = ?, published_at = ?, error_message = NULL,
                        updated_at = ?
                    WHERE id = ? AND status = ? AND (?7 IS NULL OR claim_token = ?7)
                    "#,
                )
                .bind(new.as_str())
                .bind(cast_hash)
                .bind(now)
                .bind(now)
                .bind(cast_id)
                .bind(expected.as_str())
                .bind(claim_token)
                .execute(&self.pool)
                .await
            }
            TransitionFields::Failed {
                error_message,
                claim_token,
            } => {
                sqlx::query(
                    r#"
                    UPDATE casts
                    SET status = ?, error_message = ?, retry_count = retry_count + 1,
                        updated_at = ?
                    WHERE id = ? AND status = ? AND (?6 IS NULL OR claim_token = ?6)
                    "#,
                )
                .bind(new.as_str())
                .bind(error_message)
                .bind(now)
                .bind(cast_id)
                .bind(expected.as_str())
                .bind(claim_token)
                .execute(&self.pool)
                .await
            }
            TransitionFields::Requeue {
                scheduled_at,
                reset_retries,
            } => {
                sqlx::query(
                    r#"
                    UPDATE casts
                    SET status = ?, scheduled_at = ?, error_message = NULL,
                        claim_token = NULL, claimed_at = NULL,
                        retry_count = CASE WHEN ? THEN 0 ELSE retry_count END,
                        updated_at = ?
                    WHERE id = ? AND status = ?
                    "#,
                )
                .bind(new.as_str())
                .bind(scheduled_at)
                .bind(reset_retries)
                .bind(now)
                .bind(cast_id)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await
            }
        }
        .map_err(DbError::SqlxError)?;

        let applied = result.rows_affected() == 1;
        if !applied {
            debug!(cast_id, %expected, %new, "Conditional status update matched no row");
        }
        Ok(applied)
    }

    async fn get_cast(&self, cast_id: &str) -> Result<Option<Cast>> {
        let sql = format!("SELECT {} FROM casts WHERE id = ?", CAST_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(cast_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(cast_from_row).transpose()
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, fid, username, signer_token, signer_status
            FROM accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = col(&row, "signer_status")?;
        let signer_status = status.parse::<SignerStatus>().map_err(|reason| DbError::CorruptRow {
            table: "accounts",
            reason,
        })?;
        let token: String = col(&row, "signer_token")?;

        Ok(Some(
            Account::new(
                col::<String>(&row, "id")?,
                col::<i64>(&row, "fid")?,
                col::<String>(&row, "username")?,
                token,
            )
            .with_status(signer_status),
        ))
    }

    async fn find_thread_predecessor(&self, thread_id: &str, thread_order: i64) -> Result<Option<Cast>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM casts
            WHERE thread_id = ? AND thread_order < ?
            ORDER BY thread_order DESC
            LIMIT 1
            "#,
            CAST_COLUMNS
        );
        let mut casts = self
            .fetch_casts(sqlx::query(&sql).bind(thread_id).bind(thread_order))
            .await?;
        Ok(casts.pop())
    }

    async fn find_stale_publishing(&self, claimed_before: i64) -> Result<Vec<Cast>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM casts
            WHERE status = 'publishing' AND COALESCE(claimed_at, updated_at) < ?
            ORDER BY claimed_at ASC
            "#,
            CAST_COLUMNS
        );
        self.fetch_casts(sqlx::query(&sql).bind(claimed_before)).await
    }

    async fn find_requeueable_failed(&self, max_retry_count: i64) -> Result<Vec<Cast>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM casts
            WHERE status = 'failed' AND retry_count < ?
            ORDER BY updated_at ASC
            "#,
            CAST_COLUMNS
        );
        self.fetch_casts(sqlx::query(&sql).bind(max_retry_count)).await
    }
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| CastlineError::Database(DbError::SqlxError(e)))
}

fn cast_from_row(row: &SqliteRow) -> Result<Cast> {
    let id: String = col(row, "id")?;

    let status_text: String = col(row, "status")?;
    let status = status_text
        .parse::<CastStatus>()
        .map_err(|reason| DbError::CorruptRow {
            table: "casts",
            reason,
        })?;

    let raw_metadata: Option<String> = col(row, "metadata")?;
    let (metadata, parse_error) = CastMetadata::parse(raw_metadata.as_deref());
    if let Some(reason) = parse_error {
        warn!(cast_id = %id, "Unreadable cast metadata, using defaults: {}", reason);
    }

    Ok(Cast {
        account_id: col(row, "account_id")?,
        content: col(row, "content")?,
        status,
        scheduled_at: col(row, "scheduled_at")?,
        channel_id: col(row, "channel_id")?,
        parent_hash: col(row, "parent_hash")?,
        thread_id: col(row, "thread_id")?,
        thread_order: col(row, "thread_order")?,
        cast_hash: col(row, "cast_hash")?,
        published_at: col(row, "published_at")?,
        error_message: col(row, "error_message")?,
        retry_count: col(row, "retry_count")?,
        created_by_id: col(row, "created_by_id")?,
        metadata,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        claimed_at: col(row, "claimed_at")?,
        claim_token: col(row, "claim_token")?,
        id,
    })
}

fn media_from_row(row: &SqliteRow) -> Result<Media> {
    let media_type: String = col(row, "media_type")?;
    let media_type = media_type
        .parse::<MediaType>()
        .map_err(|reason| DbError::CorruptRow {
            table: "cast_media",
            reason,
        })?;

    Ok(Media {
        id: col(row, "id")?,
        cast_id: col(row, "cast_id")?,
        url: col(row, "url")?,
        media_type,
        sort_order: col(row, "sort_order")?,
        video_status: col(row, "video_status")?,
        created_at: col(row, "created_at")?,
    })
}
