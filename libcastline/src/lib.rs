//! Castline - scheduled cast publishing
//!
//! This library holds the publication engine behind the `cast-send` daemon
//! and the `cast-queue` operator tool: the cast state machine, the SQLite
//! schedule store, the network publisher, and the due-cast sweeper.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod publisher;
pub mod retry;
pub mod scheduling;
pub mod store;
pub mod sweep;
pub mod thread;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{CastlineError, Result};
pub use publisher::{create_publisher, Publisher};
pub use store::{ScheduleStore, TransitionFields};
pub use sweep::{Sweeper, SweepSummary};
pub use types::{Account, Cast, CastStatus, Media, PublishRequest};
