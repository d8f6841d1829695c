//! Due-cast sweeper
//!
//! One call to [`Sweeper::run_sweep`] publishes every cast that is
//! `scheduled` and due. Each cast is claimed with a conditional status write
//! before the network is contacted, so overlapping sweeps never post the same
//! cast twice, and a crash mid-publish leaves the row in `publishing` where
//! [`Sweeper::reconcile_stale`] can find it.
//!
//! Failures are isolated per cast: nothing that goes wrong with one cast
//! stops the others or escapes `run_sweep`.
//!
//! Account lookups are shared only within one sweep, so a signer approved or
//! revoked between sweeps is seen by the next one.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SweepConfig};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::publisher::Publisher;
use crate::retry::{self, RequeuePolicy, RetryPolicy};
use crate::store::{ScheduleStore, TransitionFields};
use crate::thread::{self, ParentResolution};
use crate::types::{Account, Cast, CastMetadata, CastStatus, Embed, Media, PublishRequest};

const ACCOUNT_CACHE_CAPACITY: usize = 1024;
pub const INTERRUPTED_MESSAGE: &str = "publish attempt interrupted";

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Number of due casts in the batch, whatever happened to them
    pub published_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Precondition not met; still scheduled
    pub skipped: usize,
    /// Waiting on an earlier thread member; still scheduled
    pub deferred: usize,
    /// Claimed or resolved by someone else first
    pub lost_claims: usize,
    /// Unexpected store errors for a candidate
    pub errors: usize,
    /// Would have been published; dry run leaves them scheduled
    pub dry_run: usize,
}

impl SweepSummary {
    fn record(&mut self, outcome: CastOutcome) {
        match outcome {
            CastOutcome::Published => self.succeeded += 1,
            CastOutcome::Failed => self.failed += 1,
            CastOutcome::Skipped => self.skipped += 1,
            CastOutcome::Deferred => self.deferred += 1,
            CastOutcome::LostClaim => self.lost_claims += 1,
            CastOutcome::Errored => self.errors += 1,
            CastOutcome::DryRun => self.dry_run += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CastOutcome {
    Published,
    Failed,
    Skipped,
    Deferred,
    LostClaim,
    Errored,
    DryRun,
}

/// Wall-clock time for store writes during a sweep: the sweep's `now` plus
/// the time elapsed since it started.
#[derive(Debug, Clone, Copy)]
struct SweepClock {
    started_at: i64,
    started: Instant,
}

impl SweepClock {
    fn start(now: i64) -> Self {
        Self {
            started_at: now,
            started: Instant::now(),
        }
    }

    fn now(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_secs()).unwrap_or(i64::MAX);
        self.started_at.saturating_add(elapsed)
    }
}

/// State gathered before the claim and carried into the publish step
struct Claim {
    token: String,
    account: Arc<Account>,
    media: Vec<Media>,
    parent_hash: Option<String>,
}

enum ClaimStep {
    Claimed(Claim),
    NotClaimed(CastOutcome),
}

pub struct Sweeper {
    store: Arc<dyn ScheduleStore>,
    publisher: Arc<dyn Publisher>,
    config: SweepConfig,
    retry: RetryPolicy,
    requeue: RequeuePolicy,
    events: EventBus,
    accounts: Mutex<TtlCache<String, Arc<Account>>>,
    dry_run: bool,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        publisher: Arc<dyn Publisher>,
        config: SweepConfig,
    ) -> Self {
        let accounts = account_cache(&config, Arc::new(SystemClock));
        Self {
            store,
            publisher,
            config,
            retry: RetryPolicy::default(),
            requeue: RequeuePolicy::disabled(),
            events: EventBus::default(),
            accounts: Mutex::new(accounts),
            dry_run: false,
        }
    }

    /// Sweeper with sweep, retry and requeue settings taken from `config`
    pub fn from_config(
        store: Arc<dyn ScheduleStore>,
        publisher: Arc<dyn Publisher>,
        config: &Config,
    ) -> Self {
        Self::new(store, publisher, config.sweep.clone())
            .with_retry_policy(RetryPolicy::from_config(&config.retry))
            .with_requeue_policy(RequeuePolicy::from_config(&config.retry))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_requeue_policy(mut self, requeue: RequeuePolicy) -> Self {
        self.requeue = requeue;
        self
    }

    /// Clock used to expire cached account lookups
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.accounts = Mutex::new(account_cache(&self.config, clock));
        self
    }

    /// Resolve and log what would be published without claiming or writing
    /// anything. Reconciliation and requeue are skipped too.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn publisher_name(&self) -> &str {
        self.publisher.name()
    }

    /// Publish every cast due at `now`.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> SweepSummary {
        let now = now.timestamp();
        self.sweep_at(now).instrument(info_span!("sweep", now)).await
    }

    async fn sweep_at(&self, now: i64) -> SweepSummary {
        let clock = SweepClock::start(now);
        self.accounts.lock().await.clear();

        let due = match self.store.find_due_casts(now, self.config.batch_limit()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to load due casts");
                return SweepSummary::default();
            }
        };

        let mut summary = SweepSummary {
            published_count: due.len(),
            ..SweepSummary::default()
        };
        if due.is_empty() {
            debug!("No casts due");
            return summary;
        }

        info!(
            due = due.len(),
            publisher = self.publisher.name(),
            dry_run = self.dry_run,
            "Sweeping due casts"
        );
        self.events.emit(Event::SweepStarted {
            now,
            due: due.len(),
        });

        let lanes = thread::into_lanes(due);
        let outcomes: Vec<Vec<CastOutcome>> = stream::iter(lanes)
            .map(|lane| self.process_lane(lane, clock))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes.into_iter().flatten() {
            summary.record(outcome);
        }

        info!(
            published_count = summary.published_count,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            deferred = summary.deferred,
            lost_claims = summary.lost_claims,
            errors = summary.errors,
            dry_run = summary.dry_run,
            "Sweep finished"
        );
        self.events.emit(Event::SweepCompleted {
            now,
            published_count: summary.published_count,
            succeeded: summary.succeeded,
            failed: summary.failed,
        });

        summary
    }

    /// Casts in one lane run in order; a thread member only sees its
    /// predecessor's hash once that predecessor has been processed.
    async fn process_lane(&self, lane: Vec<Cast>, clock: SweepClock) -> Vec<CastOutcome> {
        let mut outcomes = Vec::with_capacity(lane.len());
        for cast in lane {
            let span = info_span!("cast", cast_id = %cast.id);
            outcomes.push(self.process_cast(cast, clock).instrument(span).await);
        }
        outcomes
    }

    async fn process_cast(&self, cast: Cast, clock: SweepClock) -> CastOutcome {
        match self.try_claim(&cast, clock.now()).await {
            Ok(ClaimStep::Claimed(claim)) => self.publish_claimed(&cast, claim, clock).await,
            Ok(ClaimStep::NotClaimed(outcome)) => outcome,
            Err(e) => {
                error!(error = %e, "Could not prepare cast; left scheduled");
                CastOutcome::Errored
            }
        }
    }

    async fn try_claim(&self, cast: &Cast, now: i64) -> Result<ClaimStep> {
        let media = self.store.find_media_for_cast(&cast.id).await?;

        let account = match self.account(&cast.account_id).await? {
            Some(account) => account,
            None => {
                return Ok(self.skip(cast, format!("account {} not found", cast.account_id)));
            }
        };
        if !account.is_approved() {
            return Ok(self.skip(
                cast,
                format!("signer for account {} is {}", account.id, account.signer_status),
            ));
        }

        let (parent_hash, replace_parent) = match thread::resolve_parent(self.store.as_ref(), cast).await? {
            ParentResolution::Stored(parent) => (parent, false),
            ParentResolution::Predecessor(hash) => (Some(hash), true),
            ParentResolution::Waiting {
                predecessor_id,
                predecessor_status,
            } => {
                debug!(
                    predecessor = %predecessor_id,
                    predecessor_status = %predecessor_status,
                    "Thread predecessor not published yet; deferring"
                );
                self.events.emit(Event::CastDeferred {
                    cast_id: cast.id.clone(),
                    waiting_on: predecessor_id,
                });
                return Ok(ClaimStep::NotClaimed(CastOutcome::Deferred));
            }
        };

        if self.dry_run {
            let request = build_request(cast, &account, &media, parent_hash);
            info!(
                content_chars = request.content.chars().count(),
                embeds = request.embeds.len(),
                channel_id = ?request.channel_id,
                parent_hash = ?request.parent_hash,
                idempotency_key = %request.idempotency_key,
                "Dry run: would publish cast"
            );
            return Ok(ClaimStep::NotClaimed(CastOutcome::DryRun));
        }

        let token = Uuid::new_v4().to_string();
        let fields = TransitionFields::Claim {
            token: token.clone(),
            parent_hash: if replace_parent { parent_hash.clone() } else { None },
        };
        let claimed = self
            .store
            .compare_and_set_status(&cast.id, CastStatus::Scheduled, CastStatus::Publishing, fields, now)
            .await?;
        if !claimed {
            debug!("Cast already claimed by another sweep");
            return Ok(ClaimStep::NotClaimed(CastOutcome::LostClaim));
        }

        Ok(ClaimStep::Claimed(Claim {
            token,
            account,
            media,
            parent_hash,
        }))
    }

    fn skip(&self, cast: &Cast, reason: String) -> ClaimStep {
        warn!(reason = %reason, "Skipping cast; it stays scheduled");
        self.events.emit(Event::CastSkipped {
            cast_id: cast.id.clone(),
            reason,
        });
        ClaimStep::NotClaimed(CastOutcome::Skipped)
    }

    async fn publish_claimed(&self, cast: &Cast, claim: Claim, clock: SweepClock) -> CastOutcome {
        let request = build_request(cast, &claim.account, &claim.media, claim.parent_hash);

        let result = retry::publish_with_retry(
            self.publisher.as_ref(),
            &request,
            self.config.publish_timeout(),
            &self.retry,
        )
        .await;

        match result {
            Ok(hash) => self.mark_published(cast, &claim.token, hash, clock).await,
            Err(e) => self.mark_failed(cast, &claim.token, e.to_string(), clock).await,
        }
    }

    async fn mark_published(&self, cast: &Cast, token: &str, hash: String, clock: SweepClock) -> CastOutcome {
        let fields = TransitionFields::Published {
            cast_hash: hash.clone(),
            claim_token: Some(token.to_string()),
        };
        match self
            .store
            .compare_and_set_status(
                &cast.id,
                CastStatus::Publishing,
                CastStatus::Published,
                fields,
                clock.now(),
            )
            .await
        {
            Ok(true) => {
                info!(cast_hash = %hash, "Cast published");
                self.events.emit(Event::CastPublished {
                    cast_id: cast.id.clone(),
                    cast_hash: hash,
                });
                CastOutcome::Published
            }
            Ok(false) => {
                error!(cast_hash = %hash, "Cast reached the network but its claim was taken over");
                CastOutcome::LostClaim
            }
            Err(e) => {
                error!(cast_hash = %hash, error = %e, "Failed to record published cast");
                let message = format!("published as {} but recording failed: {}", hash, e);
                self.mark_failed(cast, token, message, clock).await
            }
        }
    }

    async fn mark_failed(&self, cast: &Cast, token: &str, message: String, clock: SweepClock) -> CastOutcome {
        let fields = TransitionFields::Failed {
            error_message: message.clone(),
            claim_token: Some(token.to_string()),
        };
        match self
            .store
            .compare_and_set_status(&cast.id, CastStatus::Publishing, CastStatus::Failed, fields, clock.now())
            .await
        {
            Ok(true) => {
                warn!(error = %message, "Cast failed");
                self.events.emit(Event::CastFailed {
                    cast_id: cast.id.clone(),
                    error: message,
                    retry_count: cast.retry_count + 1,
                });
                CastOutcome::Failed
            }
            Ok(false) => {
                warn!(error = %message, "Cast failed but its claim was taken over");
                CastOutcome::LostClaim
            }
            Err(e) => {
                error!(error = %e, publish_error = %message, "Failed to record cast failure; row left publishing");
                CastOutcome::Errored
            }
        }
    }

    async fn account(&self, account_id: &str) -> Result<Option<Arc<Account>>> {
        let key = account_id.to_string();
        if let Some(account) = self.accounts.lock().await.get(&key) {
            return Ok(Some(account));
        }

        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(None);
        };
        let account = Arc::new(account);
        self.accounts.lock().await.insert(key, Arc::clone(&account));
        Ok(Some(account))
    }

    /// Move casts stuck in `publishing` for longer than
    /// `sweep.stale_publishing_after` seconds to `failed`.
    ///
    /// Returns the number of casts moved.
    pub async fn reconcile_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        self.reconcile_older_than(now, self.config.stale_publishing_after)
            .await
    }

    pub async fn reconcile_older_than(&self, now: DateTime<Utc>, older_than_secs: u64) -> Result<usize> {
        if self.dry_run {
            debug!("Dry run: skipping reconciliation");
            return Ok(0);
        }
        let moved = reconcile_interrupted(self.store.as_ref(), now, older_than_secs).await?;
        for cast in &moved {
            self.events.emit(Event::CastFailed {
                cast_id: cast.id.clone(),
                error: INTERRUPTED_MESSAGE.to_string(),
                retry_count: cast.retry_count + 1,
            });
        }
        Ok(moved.len())
    }

    /// Put failed casts back on the schedule with exponential backoff.
    ///
    /// Does nothing unless automatic requeue is enabled. Returns the number
    /// of casts requeued.
    pub async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.requeue.enabled || self.dry_run {
            return Ok(0);
        }

        let now = now.timestamp();
        let failed = self
            .store
            .find_requeueable_failed(self.requeue.max_requeues)
            .await?;

        let mut requeued = 0;
        for cast in failed {
            let at = self
                .requeue
                .next_attempt_at(cast.updated_at, cast.retry_count, now);
            let fields = TransitionFields::Requeue {
                scheduled_at: at,
                reset_retries: false,
            };
            if self
                .store
                .compare_and_set_status(&cast.id, CastStatus::Failed, CastStatus::Scheduled, fields, now)
                .await?
            {
                info!(cast_id = %cast.id, retry_count = cast.retry_count, scheduled_at = at, "Requeued failed cast");
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

/// Move casts claimed more than `older_than_secs` before `now` and still
/// `publishing` to `failed`, returning them as they were before the move.
///
/// The claim token is matched, so a sweep that finishes late wins over
/// reconciliation.
pub async fn reconcile_interrupted<S>(store: &S, now: DateTime<Utc>, older_than_secs: u64) -> Result<Vec<Cast>>
where
    S: ScheduleStore + ?Sized,
{
    let now = now.timestamp();
    let cutoff = now.saturating_sub(i64::try_from(older_than_secs).unwrap_or(i64::MAX));
    let stale = store.find_stale_publishing(cutoff).await?;

    let mut moved = Vec::new();
    for cast in stale {
        let fields = TransitionFields::Failed {
            error_message: INTERRUPTED_MESSAGE.to_string(),
            claim_token: cast.claim_token.clone(),
        };
        if store
            .compare_and_set_status(&cast.id, CastStatus::Publishing, CastStatus::Failed, fields, now)
            .await?
        {
            warn!(cast_id = %cast.id, claimed_at = ?cast.claimed_at, "Marked interrupted cast as failed");
            moved.push(cast);
        }
    }
    Ok(moved)
}

fn account_cache(config: &SweepConfig, clock: Arc<dyn Clock>) -> TtlCache<String, Arc<Account>> {
    TtlCache::new(config.account_cache_ttl, ACCOUNT_CACHE_CAPACITY, clock)
}

fn build_request(cast: &Cast, account: &Account, media: &[Media], parent_hash: Option<String>) -> PublishRequest {
    PublishRequest {
        cast_id: cast.id.clone(),
        signer_token: SecretString::from(account.signer_token.expose_secret().to_owned()),
        content: cast.content.clone(),
        embeds: build_embeds(media, &cast.metadata),
        channel_id: cast.channel_id.clone(),
        parent_hash,
        idempotency_key: cast.idempotency_key(),
    }
}

/// Embeds for a cast: media urls by ascending `sort_order`, then the quoted
/// cast if there is one.
pub fn build_embeds(media: &[Media], metadata: &CastMetadata) -> Vec<Embed> {
    let mut ordered: Vec<&Media> = media.iter().collect();
    ordered.sort_by_key(|m| m.sort_order);

    let mut embeds: Vec<Embed> = ordered
        .into_iter()
        .map(|m| Embed::Url { url: m.url.clone() })
        .collect();

    if let Some(quote) = &metadata.quote {
        embeds.push(Embed::Cast {
            cast_id: quote.clone(),
        });
    }
    embeds
}
