//! Retry policies and the per-class retry budget.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::classify::FailureClass;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); the delay moves by up to ± this fraction
    pub jitter: f64,
}

impl RetryPolicy {
    /// Bounded policy for rejected credentials.
    ///
    /// Every attempt against bad credentials extends the upstream lockout
    /// timer, so the budget is small and the delay does not grow.
    pub fn auth_failure() -> Self {
        Self::fixed(3, Duration::from_secs(20))
    }

    /// Policy for network blips: base 2s, cap 60s, ±25% jitter, 6 attempts.
    pub fn transient_network() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.25,
        }
    }

    /// Create a policy with fixed delays and no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let sample = if self.jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_sample(attempt, sample)
    }

    /// Same as [`RetryPolicy::delay_for_attempt`] with the jitter draw
    /// supplied by the caller (`sample` in `[-1.0, 1.0]`).
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        let jitter = delay_ms * self.jitter * sample.clamp(-1.0, 1.0);
        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// The asymmetric policy set used by the guard and the worker runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardPolicies {
    pub auth_failure: RetryPolicy,
    pub transient_network: RetryPolicy,
}

impl Default for GuardPolicies {
    fn default() -> Self {
        Self {
            auth_failure: RetryPolicy::auth_failure(),
            transient_network: RetryPolicy::transient_network(),
        }
    }
}

impl GuardPolicies {
    /// Policy governing a failure class. `None` means never retry.
    ///
    /// Unclassified failures get the bounded auth budget: if we cannot tell
    /// what went wrong we must not hammer the account.
    pub fn for_class(&self, class: FailureClass) -> Option<&RetryPolicy> {
        match class {
            FailureClass::AuthFailure | FailureClass::Unknown => Some(&self.auth_failure),
            FailureClass::TransientNetwork => Some(&self.transient_network),
            FailureClass::ConfigViolation => None,
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `next_attempt`.
    Retry { next_attempt: u32, delay: Duration },
    /// Budget for this class is spent.
    GiveUp { attempts: u32 },
    /// Never retried (configuration problems).
    Fatal,
}

/// In-process retry budget, counted per failure class.
///
/// Lives only as long as the operation (or run loop) it guards; nothing is
/// persisted.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policies: GuardPolicies,
    auth_failures: u32,
    transient_failures: u32,
}

impl RetryTracker {
    pub fn new(policies: GuardPolicies) -> Self {
        Self {
            policies,
            auth_failures: 0,
            transient_failures: 0,
        }
    }

    /// Record one failed attempt and decide what happens next.
    pub fn record(&mut self, class: FailureClass) -> RetryDecision {
        let Some(policy) = self.policies.for_class(class) else {
            return RetryDecision::Fatal;
        };
        let counter = match class {
            FailureClass::TransientNetwork => &mut self.transient_failures,
            _ => &mut self.auth_failures,
        };
        *counter += 1;
        let failures = *counter;

        if policy.should_retry(failures) {
            RetryDecision::Retry {
                next_attempt: failures + 1,
                delay: policy.delay_for_attempt(failures),
            }
        } else {
            RetryDecision::GiveUp { attempts: failures }
        }
    }

    /// Forget past failures after a success.
    pub fn reset(&mut self) {
        self.auth_failures = 0;
        self.transient_failures = 0;
    }

    pub fn failures(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::TransientNetwork => self.transient_failures,
            FailureClass::ConfigViolation => 0,
            _ => self.auth_failures,
        }
    }
}
