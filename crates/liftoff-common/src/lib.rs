//! Configuration and shared error types for liftoff.
//!
//! This crate provides functionality used across the liftoff workspace:
//! - The immutable [`ConfigStore`], selected by a [`Profile`] discriminator
//! - Typed [`Settings`] sections with serde defaults
//! - Error types using `thiserror` for configuration and support services

pub mod config;
pub mod error;

pub use config::{
    CONFIG_FILE_ENV, CacheBackend, CacheSettings, ConfigLoader, ConfigStore, DatabaseSettings,
    ENV_PREFIX, LogFormat, LogSettings, MODE_ENV, Profile, RateLimitSettings, ReportingSettings,
    ServerSettings, Settings, TaskSettings,
};
pub use error::{ConfigError, SupportError};
