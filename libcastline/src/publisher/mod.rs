//! Network publisher abstraction
//!
//! The sweeper hands each claimed cast to a [`Publisher`], which posts it to
//! the network and returns the network-assigned cast hash. The core treats
//! the call as an opaque, fallible RPC.
//!
//! # Examples
//!
//! ```no_run
//! use libcastline::publisher::{Publisher, mock::MockPublisher};
//! use libcastline::types::PublishRequest;
//!
//! # async fn example(request: PublishRequest) {
//! let publisher = MockPublisher::with_hash("0xABC");
//!
//! match publisher.publish(&request).await {
//!     Ok(hash) => println!("Published as {}", hash),
//!     Err(e) => eprintln!("Publish failed: {}", e),
//! }
//! # }
//! ```

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{PublisherConfig, PublisherKind};
use crate::error::{ConfigError, PublishError, Result};
use crate::types::PublishRequest;

pub mod http;

// Available for all builds (not just tests) so the daemon can run with kind = "mock"
pub mod mock;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Post one cast.
    ///
    /// Returns the network-assigned hash on success. Any error moves the cast
    /// to `failed`; transient errors may first be retried by the sweeper.
    async fn publish(&self, request: &PublishRequest) -> std::result::Result<String, PublishError>;

    /// Short identifier used in logs
    fn name(&self) -> &str;
}

#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, request: &PublishRequest) -> std::result::Result<String, PublishError> {
        (**self).publish(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Build the publisher selected in configuration.
///
/// With `dry_run` no API key is required and the mock publisher is
/// returned; a dry-run [`crate::sweep::Sweeper`] never calls it.
pub fn create_publisher(config: &PublisherConfig, dry_run: bool) -> Result<Arc<dyn Publisher>> {
    if dry_run || config.kind == PublisherKind::Mock {
        return Ok(Arc::new(mock::MockPublisher::success()));
    }

    let api_key = std::env::var(&config.api_key_env).map_err(|_| {
        ConfigError::MissingField(format!(
            "publisher API key (set the {} environment variable)",
            config.api_key_env
        ))
    })?;

    let publisher = http::HttpPublisher::new(
        &config.api_url,
        api_key.into(),
        std::time::Duration::from_secs(config.request_timeout),
    )?;
    Ok(Arc::new(publisher))
}
