//! Core types for Castline

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single unit of content scheduled for publication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cast {
    pub id: String,
    pub account_id: String,
    pub content: String,
    pub status: CastStatus,
    /// Unix seconds. Only authoritative once the cast is `scheduled`.
    pub scheduled_at: i64,
    pub channel_id: Option<String>,
    pub parent_hash: Option<String>,
    pub thread_id: Option<String>,
    pub thread_order: Option<i64>,
    pub cast_hash: Option<String>,
    pub published_at: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_by_id: Option<String>,
    pub metadata: CastMetadata,
    pub created_at: i64,
    pub updated_at: i64,
    pub claimed_at: Option<i64>,
    pub claim_token: Option<String>,
}

impl Cast {
    /// Create a new draft owned by `account_id`.
    pub fn new(account_id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            content: content.into(),
            status: CastStatus::Draft,
            scheduled_at: now,
            channel_id: None,
            parent_hash: None,
            thread_id: None,
            thread_order: None,
            cast_hash: None,
            published_at: None,
            error_message: None,
            retry_count: 0,
            created_by_id: None,
            metadata: CastMetadata::default(),
            created_at: now,
            updated_at: now,
            claimed_at: None,
            claim_token: None,
        }
    }

    /// Builder-style helper used by composers and tests.
    pub fn scheduled(mut self, at: i64) -> Self {
        self.status = CastStatus::Scheduled;
        self.scheduled_at = at;
        self
    }

    pub fn in_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn replying_to(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = Some(parent_hash.into());
        self
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>, order: i64) -> Self {
        self.thread_id = Some(thread_id.into());
        self.thread_order = Some(order);
        self
    }

    /// Key under which the network may deduplicate replays of this cast.
    pub fn idempotency_key(&self) -> String {
        self.metadata
            .idempotency_key
            .clone()
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Lifecycle state of a cast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CastStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl CastStatus {
    pub const ALL: [CastStatus; 5] = [
        CastStatus::Draft,
        CastStatus::Scheduled,
        CastStatus::Publishing,
        CastStatus::Published,
        CastStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CastStatus::Draft => "draft",
            CastStatus::Scheduled => "scheduled",
            CastStatus::Publishing => "publishing",
            CastStatus::Published => "published",
            CastStatus::Failed => "failed",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `failed -> scheduled` is only taken by explicit operator actions
    /// (reschedule, retry) or the opt-in automatic requeue.
    pub fn can_transition_to(&self, next: CastStatus) -> bool {
        use CastStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Scheduled, Publishing)
                | (Scheduled, Scheduled)
                | (Publishing, Published)
                | (Publishing, Failed)
                | (Failed, Scheduled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CastStatus::Published | CastStatus::Failed)
    }
}

impl fmt::Display for CastStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CastStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(CastStatus::Draft),
            "scheduled" => Ok(CastStatus::Scheduled),
            "publishing" => Ok(CastStatus::Publishing),
            "published" => Ok(CastStatus::Published),
            "failed" => Ok(CastStatus::Failed),
            other => Err(format!(
                "Invalid cast status: '{}'. Valid options: draft, scheduled, publishing, published, failed",
                other
            )),
        }
    }
}

/// Kind of media attached to a cast
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
        }
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(MediaType::Image),
            "video" => Ok(MediaType::Video),
            other => Err(format!("Invalid media type: '{}'", other)),
        }
    }
}

/// An attachment row. Belongs to exactly one cast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Media {
    pub id: String,
    pub cast_id: String,
    pub url: String,
    pub media_type: MediaType,
    pub sort_order: i64,
    /// Written by the external transcoder; never read by the sweep.
    pub video_status: Option<String>,
    pub created_at: i64,
}

impl Media {
    pub fn new(cast_id: impl Into<String>, url: impl Into<String>, media_type: MediaType, sort_order: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cast_id: cast_id.into(),
            url: url.into(),
            media_type,
            sort_order,
            video_status: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Authorization state of an account's signer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignerStatus {
    PendingApproval,
    Approved,
    Revoked,
}

impl SignerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignerStatus::PendingApproval => "pending_approval",
            SignerStatus::Approved => "approved",
            SignerStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for SignerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(SignerStatus::PendingApproval),
            "approved" => Ok(SignerStatus::Approved),
            "revoked" => Ok(SignerStatus::Revoked),
            other => Err(format!("Invalid signer status: '{}'", other)),
        }
    }
}

/// A connected social account. The signer token is never printed.
#[derive(Debug)]
pub struct Account {
    pub id: String,
    pub fid: i64,
    pub username: String,
    pub signer_token: SecretString,
    pub signer_status: SignerStatus,
}

impl Account {
    pub fn new(id: impl Into<String>, fid: i64, username: impl Into<String>, signer_token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fid,
            username: username.into(),
            signer_token: SecretString::from(signer_token.into()),
            signer_status: SignerStatus::PendingApproval,
        }
    }

    pub fn with_status(mut self, status: SignerStatus) -> Self {
        self.signer_status = status;
        self
    }

    pub fn is_approved(&self) -> bool {
        self.signer_status == SignerStatus::Approved
    }
}

/// Reference to a cast already on the network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CastRef {
    pub fid: i64,
    pub hash: String,
}

/// Structured options stored alongside a cast as JSON text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CastMetadata {
    /// Cast quoted as the last embed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<CastRef>,
    /// Overrides the cast id as the deduplication key sent to the network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl CastMetadata {
    /// Parse stored metadata, falling back to the default when the text is
    /// not valid. The caller is told about the fallback so it can log it.
    pub fn parse(raw: Option<&str>) -> (Self, Option<String>) {
        match raw {
            None => (Self::default(), None),
            Some(text) if text.trim().is_empty() => (Self::default(), None),
            Some(text) => match serde_json::from_str(text) {
                Ok(metadata) => (metadata, None),
                Err(e) => (Self::default(), Some(e.to_string())),
            },
        }
    }

    /// Serialize for storage; `None` when there is nothing worth storing.
    pub fn to_stored(&self) -> Option<String> {
        if self == &Self::default() {
            return None;
        }
        serde_json::to_string(self).ok()
    }
}

/// One entry in the embed list sent to the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Embed {
    Url { url: String },
    Cast { cast_id: CastRef },
}

impl Embed {
    pub fn url(&self) -> Option<&str> {
        match self {
            Embed::Url { url } => Some(url),
            Embed::Cast { .. } => None,
        }
    }
}

/// Everything a publisher needs to post one cast
#[derive(Debug)]
pub struct PublishRequest {
    pub cast_id: String,
    pub signer_token: SecretString,
    pub content: String,
    pub embeds: Vec<Embed>,
    pub channel_id: Option<String>,
    pub parent_hash: Option<String>,
    pub idempotency_key: String,
}
