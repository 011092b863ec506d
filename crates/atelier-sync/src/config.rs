use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;

/// Server-side hard cap on page size.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Who this client acts as. Optimistic messages and reactions carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: Option<String>,
}

impl Identity {
    pub fn new(user_id: Uuid, username: Option<String>) -> Self {
        Self { user_id, username }
    }
}

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Messages requested per history page.
    pub page_size: u32,
    /// Max change-feed updates held while waiting for their insert.
    pub orphan_capacity: usize,
    /// How long such an update is kept before it is dropped.
    pub orphan_ttl: Duration,
    /// First wait before resubscribing a closed change feed. Doubles per
    /// failed attempt.
    pub feed_retry: Duration,
    /// Ceiling for the resubscribe wait.
    pub feed_retry_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            orphan_capacity: 256,
            orphan_ttl: Duration::from_secs(30),
            feed_retry: Duration::from_millis(500),
            feed_retry_max: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Read `ATELIER_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("ATELIER_PAGE_SIZE") {
            config.page_size = parse("ATELIER_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("ATELIER_ORPHAN_CAPACITY") {
            config.orphan_capacity = parse("ATELIER_ORPHAN_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("ATELIER_ORPHAN_TTL_SECS") {
            config.orphan_ttl = Duration::from_secs(parse("ATELIER_ORPHAN_TTL_SECS", &v)?);
        }

        if let Some(v) = lookup("ATELIER_FEED_RETRY_MS") {
            config.feed_retry = Duration::from_millis(parse("ATELIER_FEED_RETRY_MS", &v)?);
        }
        if let Some(v) = lookup("ATELIER_FEED_RETRY_MAX_SECS") {
            config.feed_retry_max = Duration::from_secs(parse("ATELIER_FEED_RETRY_MAX_SECS", &v)?);
        }

        Ok(config.normalized())
    }

    /// Clamp values into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.orphan_capacity = self.orphan_capacity.max(1);
        self.feed_retry_max = self.feed_retry_max.max(self.feed_retry);
        self
    }
}

impl Identity {
    /// Read `ATELIER_USER_ID` (required) and `ATELIER_USERNAME`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup("ATELIER_USER_ID").ok_or(ConfigError::Missing("ATELIER_USER_ID"))?;
        let user_id = parse("ATELIER_USER_ID", &raw)?;
        Ok(Self::new(user_id, lookup("ATELIER_USERNAME")))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}
