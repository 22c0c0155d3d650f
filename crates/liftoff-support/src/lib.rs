//! Support services for liftoff.
//!
//! This crate provides the auxiliary services wired in during startup:
//! - [`CacheClient`]: Key/value cache over a pluggable [`CacheStore`]
//! - [`RateLimiter`]: Per-client request limiting
//! - [`ErrorReporter`]: Optional forwarding of unmapped faults
//!
//! The three are independent of each other and are all built from
//! [`Settings`] by [`SupportServices::init`].

pub mod cache;
pub mod rate_limit;
pub mod reporter;

use std::fmt;
use std::sync::Arc;

use tracing::info;

use liftoff_common::{Settings, SupportError};

pub use cache::{CacheClient, CacheStore, MemoryCache, NullCache};
pub use rate_limit::{FixedWindowLimiter, RateDecision, RateLimiter, Unlimited};
pub use reporter::{ErrorReport, ErrorReporter, HttpReporter, init_reporter};

/// Handles to every support service.
#[derive(Clone)]
pub struct SupportServices {
    /// Application cache.
    pub cache: CacheClient,
    /// Request limiter. [`Unlimited`] when limiting is disabled.
    pub limiter: Arc<dyn RateLimiter>,
    /// Fault reporter. `None` when reporting is disabled.
    pub reporter: Option<Arc<dyn ErrorReporter>>,
}

impl SupportServices {
    /// Build every service from settings.
    ///
    /// `environment` tags error reports when `reporting.environment` is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the reporter is enabled but misconfigured.
    pub fn init(settings: &Settings, environment: &str) -> Result<Self, SupportError> {
        let cache = CacheClient::from_settings(&settings.cache);

        let limiter: Arc<dyn RateLimiter> = if settings.rate_limit.enabled {
            Arc::new(FixedWindowLimiter::from_settings(&settings.rate_limit))
        } else {
            Arc::new(Unlimited)
        };

        let reporter = init_reporter(&settings.reporting, environment)?;

        info!(
            cache = cache.backend(),
            rate_limit = limiter.is_enforcing(),
            reporting = reporter.is_some(),
            "Support services ready"
        );

        Ok(Self {
            cache,
            limiter,
            reporter,
        })
    }

    /// Services with an in-memory cache, no limiting and no reporter.
    pub fn disabled() -> Self {
        Self {
            cache: CacheClient::from_settings(&liftoff_common::CacheSettings::default()),
            limiter: Arc::new(Unlimited),
            reporter: None,
        }
    }
}

impl fmt::Debug for SupportServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupportServices")
            .field("cache", &self.cache)
            .field("rate_limit", &self.limiter.is_enforcing())
            .field("reporting", &self.reporter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_common::{ConfigStore, Profile};
    use tokio_test::assert_err;

    #[test]
    fn test_dev_profile_services() {
        let config = ConfigStore::for_profile(Profile::Dev).unwrap();
        let services = SupportServices::init(config.settings(), "dev").unwrap();

        assert_eq!(services.cache.backend(), "memory");
        assert!(!services.limiter.is_enforcing());
        assert!(services.reporter.is_none());
    }

    #[test]
    fn test_enabled_limiter() {
        let mut settings = Settings::default();
        settings.rate_limit.enabled = true;
        settings.rate_limit.requests = 1;

        let services = SupportServices::init(&settings, "test").unwrap();
        assert!(services.limiter.check("client").allowed);
        assert!(!services.limiter.check("client").allowed);
    }

    #[test]
    fn test_misconfigured_reporter_fails() {
        let mut settings = Settings::default();
        settings.reporting.enabled = true;

        let err = assert_err!(SupportServices::init(&settings, "test"));
        assert!(matches!(err, SupportError::MissingDsn));
    }
}
