//! Throttling configuration.
//!
//! All thresholds are configuration, not fixed behavior. The defaults follow
//! common guidance (lock after 5 failures for 15 minutes) and can be overridden
//! programmatically or from `PORTCULLIS_*` environment variables.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Error, error::ValidationError};

/// One step of a [`DelaySchedule::Stepped`] schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayStep {
    /// Applies once this many failures beyond the delay threshold have accrued (1-based)
    pub after: u32,
    pub delay: Duration,
}

/// Maps failures beyond the delay threshold to a slow-down.
///
/// Every variant is non-decreasing in its input. The configured `max_delay`
/// caps the result, so no schedule can produce an unbounded wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelaySchedule {
    /// The same delay regardless of how many failures accrued
    Fixed { delay: Duration },
    /// `step * excess`
    Linear { step: Duration },
    /// `base * 2^(excess - 1)`
    Exponential { base: Duration },
    /// Explicit table, thresholds strictly increasing
    Stepped { steps: Vec<DelayStep> },
}

impl DelaySchedule {
    /// Delay for the `excess`-th failure beyond the threshold. Zero for `excess == 0`.
    pub fn delay_for(&self, excess: u32) -> Duration {
        if excess == 0 {
            return Duration::ZERO;
        }

        match self {
            DelaySchedule::Fixed { delay } => *delay,
            DelaySchedule::Linear { step } => step.saturating_mul(excess),
            DelaySchedule::Exponential { base } => {
                let shift = (excess - 1).min(31);
                base.saturating_mul(1u32 << shift)
            }
            DelaySchedule::Stepped { steps } => steps
                .iter()
                .take_while(|step| step.after <= excess)
                .last()
                .map(|step| step.delay)
                .unwrap_or(Duration::ZERO),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if let DelaySchedule::Stepped { steps } = self {
            for pair in steps.windows(2) {
                if pair[1].after <= pair[0].after {
                    return Err(ValidationError::InvalidConfiguration(
                        "stepped delay thresholds must be strictly increasing".to_string(),
                    ));
                }
                if pair[1].delay < pair[0].delay {
                    return Err(ValidationError::InvalidConfiguration(
                        "stepped delays must not decrease".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for DelaySchedule {
    fn default() -> Self {
        DelaySchedule::Exponential {
            base: Duration::from_secs(1),
        }
    }
}

/// Longest accepted `lock_duration` or `attempt_window`, about a century.
///
/// Keeps `now + lock_duration` and `now - attempt_window` inside the range
/// chrono can represent.
pub const MAX_TRACKING_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Configuration for attempt tracking, progressive delay and lockout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// When false, checks always allow and recordings are no-ops
    pub enabled: bool,
    /// Failures at which the progressive delay starts
    pub max_attempts_before_delay: u32,
    /// Failures at which the identity is locked
    pub max_attempts_before_lock: u32,
    pub lock_duration: Duration,
    /// Records whose last failure is older than this are treated as empty
    pub attempt_window: Duration,
    pub delay_schedule: DelaySchedule,
    /// Upper bound for any progressive delay
    pub max_delay: Duration,
    /// Suspension used in place of password verification for unknown users
    pub dummy_verify_cost: Duration,
    /// How often the background sweep removes stale records
    pub sweep_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts_before_delay: 3,
            max_attempts_before_lock: 5,
            lock_duration: Duration::from_secs(15 * 60),
            attempt_window: Duration::from_secs(15 * 60),
            delay_schedule: DelaySchedule::default(),
            max_delay: Duration::from_secs(10),
            dummy_verify_cost: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl ThrottleConfig {
    /// A configuration that turns protection off entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts_before_delay(mut self, attempts: u32) -> Self {
        self.max_attempts_before_delay = attempts;
        self
    }

    pub fn with_max_attempts_before_lock(mut self, attempts: u32) -> Self {
        self.max_attempts_before_lock = attempts;
        self
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_attempt_window(mut self, window: Duration) -> Self {
        self.attempt_window = window;
        self
    }

    pub fn with_delay_schedule(mut self, schedule: DelaySchedule) -> Self {
        self.delay_schedule = schedule;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_dummy_verify_cost(mut self, cost: Duration) -> Self {
        self.dummy_verify_cost = cost;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Check the configuration for values the policy cannot honor.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_attempts_before_lock == 0 {
            return Err(invalid("max_attempts_before_lock must be at least 1"));
        }
        if self.max_attempts_before_delay == 0 {
            return Err(invalid("max_attempts_before_delay must be at least 1"));
        }
        if self.max_attempts_before_delay > self.max_attempts_before_lock {
            return Err(invalid(
                "max_attempts_before_delay must not exceed max_attempts_before_lock",
            ));
        }
        if self.lock_duration.is_zero() {
            return Err(invalid("lock_duration must be positive"));
        }
        if self.attempt_window.is_zero() {
            return Err(invalid("attempt_window must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("sweep_interval must be positive"));
        }
        for (name, duration) in [
            ("lock_duration", self.lock_duration),
            ("attempt_window", self.attempt_window),
        ] {
            if duration > MAX_TRACKING_DURATION {
                return Err(invalid(&format!(
                    "{name} must not exceed {} seconds",
                    MAX_TRACKING_DURATION.as_secs()
                )));
            }
        }
        self.delay_schedule.validate()?;
        Ok(())
    }

    /// Build a configuration from `PORTCULLIS_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are rejected.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(enabled) = env_parse::<bool>("PORTCULLIS_ENABLED")? {
            config.enabled = enabled;
        }
        if let Some(attempts) = env_parse("PORTCULLIS_MAX_ATTEMPTS_BEFORE_DELAY")? {
            config.max_attempts_before_delay = attempts;
        }
        if let Some(attempts) = env_parse("PORTCULLIS_MAX_ATTEMPTS_BEFORE_LOCK")? {
            config.max_attempts_before_lock = attempts;
        }
        if let Some(secs) = env_parse("PORTCULLIS_LOCK_DURATION_SECS")? {
            config.lock_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("PORTCULLIS_ATTEMPT_WINDOW_SECS")? {
            config.attempt_window = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse("PORTCULLIS_DELAY_BASE_MS")? {
            config.delay_schedule = DelaySchedule::Exponential {
                base: Duration::from_millis(ms),
            };
        }
        if let Some(ms) = env_parse("PORTCULLIS_MAX_DELAY_MS")? {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("PORTCULLIS_DUMMY_VERIFY_COST_MS")? {
            config.dummy_verify_cost = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse("PORTCULLIS_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs);
        }

        config.validate()?;

        tracing::debug!(
            enabled = config.enabled,
            max_attempts_before_delay = config.max_attempts_before_delay,
            max_attempts_before_lock = config.max_attempts_before_lock,
            lock_duration_secs = config.lock_duration.as_secs(),
            attempt_window_secs = config.attempt_window.as_secs(),
            "Loaded throttle configuration from environment"
        );

        Ok(config)
    }
}

fn invalid(message: &str) -> Error {
    Error::Validation(ValidationError::InvalidConfiguration(message.to_string()))
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::Validation(ValidationError::InvalidField(format!(
                "{name} has an invalid value: {raw}"
            )))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ThrottleConfig::default();
        config.validate().unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_attempts_before_lock, 5);
        assert_eq!(config.lock_duration, Duration::from_secs(900));
    }

    #[test]
    fn test_disabled_config() {
        let config = ThrottleConfig::disabled();
        assert!(!config.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let zero_lock = ThrottleConfig::default().with_max_attempts_before_lock(0);
        assert!(zero_lock.validate().unwrap_err().is_validation_error());

        let delay_after_lock = ThrottleConfig::default()
            .with_max_attempts_before_delay(6)
            .with_max_attempts_before_lock(5);
        assert!(delay_after_lock.validate().is_err());

        let no_lock = ThrottleConfig::default().with_lock_duration(Duration::ZERO);
        assert!(no_lock.validate().is_err());

        let no_window = ThrottleConfig::default().with_attempt_window(Duration::ZERO);
        assert!(no_window.validate().is_err());

        let no_sweep = ThrottleConfig::default().with_sweep_interval(Duration::ZERO);
        assert!(no_sweep.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_durations_past_the_timestamp_range() {
        let endless_lock =
            ThrottleConfig::default().with_lock_duration(Duration::from_secs(10_000_000_000_000));
        assert!(endless_lock.validate().unwrap_err().is_validation_error());

        let endless_window =
            ThrottleConfig::default().with_attempt_window(Duration::from_secs(10_000_000_000_000));
        assert!(endless_window.validate().is_err());

        let longest = ThrottleConfig::default()
            .with_lock_duration(MAX_TRACKING_DURATION)
            .with_attempt_window(MAX_TRACKING_DURATION);
        longest.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_non_monotonic_steps() {
        let unordered = ThrottleConfig::default().with_delay_schedule(DelaySchedule::Stepped {
            steps: vec![
                DelayStep {
                    after: 2,
                    delay: Duration::from_secs(1),
                },
                DelayStep {
                    after: 2,
                    delay: Duration::from_secs(2),
                },
            ],
        });
        assert!(unordered.validate().is_err());

        let decreasing = ThrottleConfig::default().with_delay_schedule(DelaySchedule::Stepped {
            steps: vec![
                DelayStep {
                    after: 1,
                    delay: Duration::from_secs(5),
                },
                DelayStep {
                    after: 2,
                    delay: Duration::from_secs(1),
                },
            ],
        });
        assert!(decreasing.validate().is_err());
    }

    #[test]
    fn test_schedules_are_non_decreasing() {
        let schedules = [
            DelaySchedule::Fixed {
                delay: Duration::from_millis(250),
            },
            DelaySchedule::Linear {
                step: Duration::from_millis(500),
            },
            DelaySchedule::Exponential {
                base: Duration::from_secs(1),
            },
            DelaySchedule::Stepped {
                steps: vec![
                    DelayStep {
                        after: 1,
                        delay: Duration::from_secs(1),
                    },
                    DelayStep {
                        after: 3,
                        delay: Duration::from_secs(4),
                    },
                ],
            },
        ];

        for schedule in schedules {
            assert_eq!(schedule.delay_for(0), Duration::ZERO);
            let mut previous = Duration::ZERO;
            for excess in 1..200 {
                let delay = schedule.delay_for(excess);
                assert!(delay >= previous, "{schedule:?} decreased at {excess}");
                previous = delay;
            }
        }
    }

    #[test]
    fn test_exponential_schedule_values() {
        let schedule = DelaySchedule::Exponential {
            base: Duration::from_millis(500),
        };
        assert_eq!(schedule.delay_for(1), Duration::from_millis(500));
        assert_eq!(schedule.delay_for(2), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(2));
        // Saturates instead of overflowing
        assert!(schedule.delay_for(u32::MAX) >= schedule.delay_for(40));
    }

    #[test]
    fn test_stepped_schedule_values() {
        let schedule = DelaySchedule::Stepped {
            steps: vec![
                DelayStep {
                    after: 2,
                    delay: Duration::from_secs(1),
                },
                DelayStep {
                    after: 4,
                    delay: Duration::from_secs(3),
                },
            ],
        };
        assert_eq!(schedule.delay_for(1), Duration::ZERO);
        assert_eq!(schedule.delay_for(2), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(3), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(4), Duration::from_secs(3));
        assert_eq!(schedule.delay_for(100), Duration::from_secs(3));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = ThrottleConfig::default().with_delay_schedule(DelaySchedule::Linear {
            step: Duration::from_millis(200),
        });
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"linear\""));

        let parsed: ThrottleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let parsed: ThrottleConfig =
            serde_json::from_str(r#"{"max_attempts_before_lock": 10}"#).unwrap();
        assert_eq!(parsed.max_attempts_before_lock, 10);
        assert_eq!(parsed.lock_duration, ThrottleConfig::default().lock_duration);
    }
}
