//! Mock publisher implementation for testing
//!
//! A scriptable publisher that can simulate successes, failures, slow or hung
//! calls without network access. Clones share state, so a test can keep a
//! handle and inspect what the sweeper sent after handing a clone over.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::PublishError;
use crate::publisher::Publisher;
use crate::types::{Embed, PublishRequest};

/// What the mock does for one call
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(String),
    Fail(PublishError),
    /// Never completes; only useful together with a sweeper timeout
    Hang,
}

/// A request as seen by the mock (the signer token is not kept)
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPublish {
    pub cast_id: String,
    pub content: String,
    pub embeds: Vec<Embed>,
    pub channel_id: Option<String>,
    pub parent_hash: Option<String>,
    pub idempotency_key: String,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockOutcome>,
    content_rules: Vec<(String, MockOutcome)>,
    default_failure: Option<PublishError>,
    fixed_hash: Option<String>,
    next_hash: u64,
    calls: Vec<RecordedPublish>,
}

#[derive(Clone)]
pub struct MockPublisher {
    state: Arc<Mutex<MockState>>,
    delay: Duration,
}

impl MockPublisher {
    /// Always succeeds with a fresh hash per call
    pub fn success() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            delay: Duration::ZERO,
        }
    }

    /// Always succeeds with the given hash
    pub fn with_hash(hash: &str) -> Self {
        let publisher = Self::success();
        publisher.lock().fixed_hash = Some(hash.to_string());
        publisher
    }

    /// Always fails with the given error
    pub fn failing(error: PublishError) -> Self {
        let publisher = Self::success();
        publisher.lock().default_failure = Some(error);
        publisher
    }

    /// Play `outcomes` in call order, then fall back to the default behaviour
    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        let publisher = Self::success();
        publisher.lock().script = outcomes.into();
        publisher
    }

    /// Every call hangs forever
    pub fn hanging() -> Self {
        Self::scripted(Vec::new()).when_content_contains("", MockOutcome::Hang)
    }

    /// Use `outcome` for any request whose content contains `needle`
    pub fn when_content_contains(self, needle: &str, outcome: MockOutcome) -> Self {
        self.lock()
            .content_rules
            .push((needle.to_string(), outcome));
        self
    }

    /// Delay every call (simulates network latency)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn calls(&self) -> Vec<RecordedPublish> {
        self.lock().calls.clone()
    }

    /// Number of calls made for one cast
    pub fn calls_for(&self, cast_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.cast_id == cast_id)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic in another test thread must not cascade into this one
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_outcome(&self, request: &PublishRequest) -> MockOutcome {
        let mut state = self.lock();

        state.calls.push(RecordedPublish {
            cast_id: request.cast_id.clone(),
            content: request.content.clone(),
            embeds: request.embeds.clone(),
            channel_id: request.channel_id.clone(),
            parent_hash: request.parent_hash.clone(),
            idempotency_key: request.idempotency_key.clone(),
        });

        if let Some(outcome) = state.script.pop_front() {
            return outcome;
        }

        if let Some((_, outcome)) = state
            .content_rules
            .iter()
            .find(|(needle, _)| request.content.contains(needle.as_str()))
        {
            return outcome.clone();
        }

        if let Some(error) = state.default_failure.clone() {
            return MockOutcome::Fail(error);
        }

        let hash = match &state.fixed_hash {
            Some(hash) => hash.clone(),
            None => {
                state.next_hash += 1;
                format!("0x{:040x}", state.next_hash)
            }
        };
        MockOutcome::Succeed(hash)
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<String, PublishError> {
        let outcome = self.next_outcome(request);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        match outcome {
            MockOutcome::Succeed(hash) => Ok(hash),
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
