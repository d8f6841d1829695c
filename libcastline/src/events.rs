//! Sweep event bus
//!
//! In-process notifications about what a sweep did, built on
//! `tokio::sync::broadcast`. Emitting never blocks: with no subscribers the
//! event is dropped, and a lagging subscriber loses the oldest events.
//! Dropping a receiver unsubscribes it. The daemon attaches
//! [`spawn_logger`]; embedders can subscribe their own consumers.
//!
//! ```
//! use libcastline::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(64, 8);
//! let mut receiver = bus.subscribe().expect("below subscriber cap");
//!
//! bus.emit(Event::CastPublished {
//!     cast_id: "c1".to_string(),
//!     cast_hash: "0xabc".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CastlineError, Result};

pub type EventReceiver = broadcast::Receiver<Event>;

pub const DEFAULT_CAPACITY: usize = 256;
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 16;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    max_subscribers: usize,
}

impl EventBus {
    /// `capacity` events are buffered per subscriber
    pub fn new(capacity: usize, max_subscribers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            max_subscribers,
        }
    }

    /// Fails once `max_subscribers` receivers are alive
    pub fn subscribe(&self) -> Result<EventReceiver> {
        if self.sender.receiver_count() >= self.max_subscribers {
            return Err(CastlineError::InvalidInput(format!(
                "event bus subscriber limit reached ({})",
                self.max_subscribers
            )));
        }
        Ok(self.sender.subscribe())
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_SUBSCRIBERS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    SweepStarted {
        now: i64,
        due: usize,
    },
    CastPublished {
        cast_id: String,
        cast_hash: String,
    },
    CastFailed {
        cast_id: String,
        error: String,
        retry_count: i64,
    },
    /// Precondition not met; the cast stays scheduled
    CastSkipped {
        cast_id: String,
        reason: String,
    },
    /// Waiting on an earlier thread member
    CastDeferred {
        cast_id: String,
        waiting_on: String,
    },
    SweepCompleted {
        now: i64,
        published_count: usize,
        succeeded: usize,
        failed: usize,
    },
}

/// Log every event on `bus` as JSON at debug level.
///
/// Takes one subscriber slot; the task ends once every handle to the bus is
/// dropped.
pub fn spawn_logger(bus: &EventBus) -> Result<JoinHandle<()>> {
    let mut receiver = bus.subscribe()?;

    Ok(tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(event = %json, "Sweep event"),
                    Err(e) => warn!(error = %e, "Failed to encode sweep event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind; events dropped")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new(10, 4);
        let mut first = bus.subscribe().unwrap();
        let mut second = bus.subscribe().unwrap();

        let event = Event::CastPublished {
            cast_id: "c1".into(),
            cast_hash: "0x1".into(),
        };
        bus.emit(event.clone());

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.emit(Event::SweepStarted { now: 1, due: 0 });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscriber_cap_and_release_on_drop() {
        let bus = EventBus::new(10, 2);
        let first = bus.subscribe().unwrap();
        let _second = bus.subscribe().unwrap();

        assert!(matches!(bus.subscribe(), Err(CastlineError::InvalidInput(_))));

        drop(first);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_oldest() {
        let bus = EventBus::new(2, 1);
        let mut receiver = bus.subscribe().unwrap();

        for now in 0..4 {
            bus.emit(Event::SweepStarted { now, due: 0 });
        }

        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(
            receiver.recv().await.unwrap(),
            Event::SweepStarted { now: 2, due: 0 }
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::CastFailed {
            cast_id: "c2".into(),
            error: "Network timeout".into(),
            retry_count: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"cast_failed\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_logger_holds_a_slot_until_bus_dropped() {
        let bus = EventBus::new(8, 1);
        let handle = spawn_logger(&bus).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.subscribe().is_err());

        bus.emit(Event::SweepStarted { now: 1, due: 0 });
        drop(bus);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("logger stops when the bus closes")
            .unwrap();
    }
}
