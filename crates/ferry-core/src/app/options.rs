//! OutboxOptions - forwarder configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::domain::{OutboxError, OutboxResult};
use crate::ports::CleanupPolicy;

pub const DEFAULT_FORWARD_INTERVAL_SECS: i64 = 1;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: i64 = 120;

/// Smallest accepted interval for both loops.
pub const MIN_INTERVAL_SECS: i64 = 1;

/// Forwarder configuration.
///
/// Intervals are signed so that out-of-range values read from a config
/// document reach `validate` and are rejected there with
/// `InvalidConfiguration` instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboxOptions {
    pub forward_interval_secs: i64,
    pub cleanup_interval_secs: i64,
    pub cleanup: CleanupPolicy,
}

impl OutboxOptions {
    /// Set the forward interval, rejecting values below one second.
    pub fn with_forward_interval_secs(mut self, secs: i64) -> OutboxResult<Self> {
        check_interval("forward interval", secs)?;
        self.forward_interval_secs = secs;
        Ok(self)
    }

    pub fn with_cleanup_interval_secs(mut self, secs: i64) -> OutboxResult<Self> {
        check_interval("cleanup interval", secs)?;
        self.cleanup_interval_secs = secs;
        Ok(self)
    }

    pub fn with_cleanup_policy(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }

    pub fn validate(&self) -> OutboxResult<()> {
        check_interval("forward interval", self.forward_interval_secs)?;
        check_interval("cleanup interval", self.cleanup_interval_secs)
    }

    pub fn forward_interval(&self) -> Duration {
        as_duration(self.forward_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        as_duration(self.cleanup_interval_secs)
    }
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            forward_interval_secs: DEFAULT_FORWARD_INTERVAL_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            cleanup: CleanupPolicy::default(),
        }
    }
}

fn check_interval(name: &str, secs: i64) -> OutboxResult<()> {
    if secs < MIN_INTERVAL_SECS {
        return Err(OutboxError::InvalidConfiguration(format!(
            "{name} must be at least {MIN_INTERVAL_SECS} second(s), got {secs}"
        )));
    }
    Ok(())
}

fn as_duration(secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(secs.max(MIN_INTERVAL_SECS)).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults() {
        let options = OutboxOptions::default();
        assert_eq!(options.forward_interval(), Duration::from_secs(1));
        assert_eq!(options.cleanup_interval(), Duration::from_secs(120));
        assert!(options.validate().is_ok());
    }

    #[rstest]
    #[case(0, false)]
    #[case(-1, false)]
    #[case(i64::MIN, false)]
    #[case(1, true)]
    #[case(5, true)]
    fn forward_interval_bounds(#[case] secs: i64, #[case] accepted: bool) {
        let result = OutboxOptions::default().with_forward_interval_secs(secs);
        match result {
            Ok(options) => {
                assert!(accepted, "{secs} should be rejected");
                assert_eq!(options.forward_interval(), Duration::from_secs(secs as u64));
            }
            Err(err) => {
                assert!(!accepted, "{secs} should be accepted");
                assert!(matches!(err, OutboxError::InvalidConfiguration(_)));
            }
        }
    }

    #[rstest]
    #[case(0)]
    #[case(-30)]
    fn cleanup_interval_below_minimum_is_rejected(#[case] secs: i64) {
        assert!(matches!(
            OutboxOptions::default().with_cleanup_interval_secs(secs),
            Err(OutboxError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn deserialized_options_are_validated_separately() {
        let options: OutboxOptions =
            serde_json::from_str(r#"{ "forward_interval_secs": 0 }"#).unwrap();
        assert_eq!(options.cleanup_interval_secs, DEFAULT_CLEANUP_INTERVAL_SECS);
        assert!(matches!(
            options.validate(),
            Err(OutboxError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn cleanup_policy_is_read_from_document() {
        let options: OutboxOptions = serde_json::from_str(
            r#"{ "cleanup": { "retention": 86400, "max_batch": 1000 } }"#,
        )
        .unwrap();
        assert_eq!(options.cleanup.retention, Duration::from_secs(86_400));
        assert_eq!(options.cleanup.max_batch, Some(1000));
    }
}
