//! Rate limiting configuration.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Configuration for the rate limiting system.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Prefix for store keys (e.g., "switchyard:rl")
    pub key_prefix: String,
    /// Whether to allow requests when the shared store is unavailable
    pub fail_open: bool,
    /// Acknowledge throttled webhooks with 200 instead of 429 so the platform
    /// does not redeliver them
    pub throttle_ack: bool,
    /// Source ids that bypass rate limiting
    pub allowlist: HashSet<String>,
    /// Limit applied to every source without an override
    pub default_limit: LimitConfig,
    /// Per-source limits
    pub overrides: HashMap<String, LimitConfig>,
}

/// Configuration for a single rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests allowed in the window
    pub requests: u32,
    /// Window duration in seconds
    pub window_secs: u64,
}

impl LimitConfig {
    /// Window length as a [`Duration`].
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            requests: 10,
            window_secs: 60,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "switchyard:rl".to_string(),
            fail_open: true,
            throttle_ack: false,
            allowlist: HashSet::new(),
            default_limit: LimitConfig::default(),
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Creates configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RATE_LIMIT_ENABLED`: Enable/disable rate limiting (default: true)
    /// - `RATE_LIMIT_PREFIX`: Store key prefix (default: "switchyard:rl")
    /// - `RATE_LIMIT_FAIL_OPEN`: Allow requests when the store is unavailable (default: true)
    /// - `RATE_LIMIT_THROTTLE_ACK`: Answer throttled webhooks with 200 (default: false)
    /// - `RATE_LIMIT_ALLOWLIST`: Comma-separated source id allowlist
    /// - `RATE_LIMIT_DEFAULT`: Default limit as "requests,window_secs" (default: "10,60")
    /// - `RATE_LIMIT_OVERRIDES`: Per-source limits as "source=requests,window_secs;..."
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RATE_LIMIT_ENABLED") {
            config.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_PREFIX") {
            config.key_prefix = val;
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_FAIL_OPEN") {
            config.fail_open = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_THROTTLE_ACK") {
            config.throttle_ack = val.parse().unwrap_or(false);
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_ALLOWLIST") {
            config.allowlist = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_DEFAULT") {
            if let Some(limit) = parse_limit_config(&val) {
                config.default_limit = limit;
            }
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_OVERRIDES") {
            config.overrides = parse_overrides(&val);
        }

        config
    }

    /// The limit that applies to `source_id`.
    pub fn limit_for(&self, source_id: &str) -> &LimitConfig {
        self.overrides.get(source_id).unwrap_or(&self.default_limit)
    }
}

/// Parses a limit config from "requests,window_secs" format.
fn parse_limit_config(val: &str) -> Option<LimitConfig> {
    let parts: Vec<&str> = val.split(',').collect();
    if parts.len() == 2 {
        let requests = parts[0].trim().parse().ok()?;
        let window_secs: u64 = parts[1].trim().parse().ok()?;
        if window_secs == 0 {
            return None;
        }
        Some(LimitConfig {
            requests,
            window_secs,
        })
    } else {
        None
    }
}

/// Parses "source=requests,window_secs;..." into per-source limits.
///
/// Malformed entries are skipped.
fn parse_overrides(val: &str) -> HashMap<String, LimitConfig> {
    val.split(';')
        .filter_map(|entry| {
            let (source, limit) = entry.split_once('=')?;
            let source = source.trim();
            if source.is_empty() {
                return None;
            }
            Some((source.to_string(), parse_limit_config(limit)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.key_prefix, "switchyard:rl");
        assert!(config.fail_open);
        assert!(!config.throttle_ack);
        assert!(config.allowlist.is_empty());
        assert_eq!(config.default_limit.requests, 10);
        assert_eq!(config.default_limit.window_secs, 60);
    }

    #[test]
    fn test_parse_limit_config() {
        let limit = parse_limit_config("10,60").unwrap();
        assert_eq!(limit.requests, 10);
        assert_eq!(limit.window_secs, 60);

        // With whitespace
        let limit = parse_limit_config(" 20 , 120 ").unwrap();
        assert_eq!(limit.requests, 20);
        assert_eq!(limit.window_secs, 120);

        // Invalid formats
        assert!(parse_limit_config("10").is_none());
        assert!(parse_limit_config("10,60,extra").is_none());
        assert!(parse_limit_config("abc,60").is_none());
        assert!(parse_limit_config("10,0").is_none());
    }

    #[test]
    fn test_parse_overrides() {
        let overrides = parse_overrides("botA=20,60; botB = 5,30;broken;=1,1");
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides["botA"].requests, 20);
        assert_eq!(overrides["botB"].window_secs, 30);
    }

    #[test]
    fn test_limit_for_falls_back_to_default() {
        let mut config = RateLimitConfig::default();
        config.overrides.insert(
            "botA".into(),
            LimitConfig {
                requests: 2,
                window_secs: 5,
            },
        );

        assert_eq!(config.limit_for("botA").requests, 2);
        assert_eq!(config.limit_for("botB"), &LimitConfig::default());
    }
}
