// Copyright 2024 The AB Update Engine Authors
//
// Licensed under a BSD-style license <LICENSE-BSD>, Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0>, or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to
// those terms.

//! Engine configuration handed to the attempter at construction.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default seconds between consecutive periodic checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(900);
/// Checks may never be scheduled closer together than this.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum seconds between consecutive periodic checks. Clamped to at
    /// least [`MIN_CHECK_INTERVAL`] by [`EngineConfig::sanitize`].
    pub check_interval_seconds: u64,

    /// Wall budget for a single policy evaluation.
    pub evaluation_timeout_ms: u64,

    /// A deferred re-evaluation older than this is dropped.
    pub expiration_timeout_ms: u64,

    pub max_p2p_attempts: u32,
    pub max_p2p_attempts_period_seconds: u64,

    // Platform-discovered flags.
    pub is_oobe_enabled: bool,
    pub is_official_build: bool,

    /// Test-only interval allowing periodic checks on unofficial builds.
    /// `None` on production configurations.
    pub unofficial_check_interval_seconds: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            check_interval_seconds: DEFAULT_CHECK_INTERVAL.as_secs(),
            evaluation_timeout_ms: 5_000,
            expiration_timeout_ms: 300_000,
            max_p2p_attempts: 10,
            max_p2p_attempts_period_seconds: 5 * 24 * 3600,
            is_oobe_enabled: true,
            is_official_build: true,
            unofficial_check_interval_seconds: None,
        }
    }
}

impl EngineConfig {
    /// Applies the documented floors so a hostile or fat-fingered config
    /// cannot drive a check storm.
    pub fn sanitize(mut self) -> Self {
        if self.check_interval_seconds < MIN_CHECK_INTERVAL.as_secs() {
            self.check_interval_seconds = MIN_CHECK_INTERVAL.as_secs();
        }
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }

    pub fn expiration_timeout(&self) -> Duration {
        Duration::from_millis(self.expiration_timeout_ms)
    }

    pub fn max_p2p_attempts_period(&self) -> Duration {
        Duration::from_secs(self.max_p2p_attempts_period_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.check_interval(), DEFAULT_CHECK_INTERVAL);
        assert!(config.is_official_build);
        assert!(config.unofficial_check_interval_seconds.is_none());
    }

    #[test]
    fn test_sanitize_clamps_check_interval() {
        let config = EngineConfig {
            check_interval_seconds: 1,
            ..Default::default()
        }
        .sanitize();
        assert_eq!(config.check_interval(), MIN_CHECK_INTERVAL);
    }

    #[test]
    fn test_deserialize_with_missing_keys_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"check_interval_seconds": 1800}"#).unwrap();
        assert_eq!(config.check_interval(), Duration::from_secs(1800));
        assert_eq!(config.evaluation_timeout_ms, 5_000);
    }
}
