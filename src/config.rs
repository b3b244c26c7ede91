//! Peer configuration with environment overrides.
use anyhow::Context;
use std::time::Duration;

/// Quiet period before a topic with missing dependencies is replayed.
pub const DEFAULT_REPLAY_DEBOUNCE: Duration = Duration::from_millis(500);
/// Interval between invite code request broadcasts.
pub const DEFAULT_INVITE_RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Time after the first broadcast before an invite code query gives up.
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Number of leading hex characters of a calendar id used as invite code.
pub const DEFAULT_INVITE_CODE_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub replay_debounce: Duration,
    pub invite_retry_interval: Duration,
    pub invite_timeout: Duration,
    pub invite_code_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replay_debounce: DEFAULT_REPLAY_DEBOUNCE,
            invite_retry_interval: DEFAULT_INVITE_RETRY_INTERVAL,
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            invite_code_len: DEFAULT_INVITE_CODE_LEN,
        }
    }
}

impl Config {
    /// Defaults, overridden by any of:
    /// - `DECAL_REPLAY_DEBOUNCE_MS`
    /// - `DECAL_INVITE_RETRY_SECS`
    /// - `DECAL_INVITE_TIMEOUT_SECS`
    /// - `DECAL_INVITE_CODE_LEN` (1..=64)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Config::default();
        let parse = |key: &str| -> anyhow::Result<Option<u64>> {
            lookup(key)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .with_context(|| format!("Failed to parse {key}={value}"))
                })
                .transpose()
        };

        if let Some(ms) = parse("DECAL_REPLAY_DEBOUNCE_MS")? {
            config.replay_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse("DECAL_INVITE_RETRY_SECS")? {
            anyhow::ensure!(secs > 0, "DECAL_INVITE_RETRY_SECS must be positive");
            config.invite_retry_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse("DECAL_INVITE_TIMEOUT_SECS")? {
            config.invite_timeout = Duration::from_secs(secs);
        }
        if let Some(len) = parse("DECAL_INVITE_CODE_LEN")? {
            anyhow::ensure!(
                (1..=64).contains(&len),
                "DECAL_INVITE_CODE_LEN must be between 1 and 64, got {len}"
            );
            config.invite_code_len = len as usize;
        }
        Ok(config)
    }
}
