//! Submission steps as data.
//!
//! A pipeline is an ordered list of `Step`s; the driver loop in
//! `SubmissionPipeline` interprets them. Adding a step is a data change.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Navigate,
    FillForm,
    AttachResume,
    Submit,
    VerifyConfirmation,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Navigate => "navigate",
            StepKind::FillForm => "fill_form",
            StepKind::AttachResume => "attach_resume",
            StepKind::Submit => "submit",
            StepKind::VerifyConfirmation => "verify_confirmation",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry bound and exponential backoff for transient step errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first execution; zero disables retrying
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: base_delay.saturating_mul(16),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub kind: StepKind,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Step {
    pub fn new(kind: StepKind, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            kind,
            timeout,
            retry,
        }
    }
}

/// The standard application flow. `Submit` is never retried: a retry after
/// an ambiguous failure could submit the form twice.
pub fn default_steps(step_timeout: Duration, retry: RetryPolicy) -> Vec<Step> {
    vec![
        Step::new(StepKind::Navigate, step_timeout, retry),
        Step::new(StepKind::FillForm, step_timeout, retry),
        Step::new(StepKind::AttachResume, step_timeout, retry),
        Step::new(StepKind::Submit, step_timeout, RetryPolicy::none()),
        Step::new(StepKind::VerifyConfirmation, step_timeout, retry),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(40), Duration::from_millis(500));
    }

    #[test]
    fn default_flow_order() {
        let steps = default_steps(Duration::from_secs(30), RetryPolicy::new(2, Duration::from_millis(500)));
        let kinds: Vec<_> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StepKind::Navigate,
                StepKind::FillForm,
                StepKind::AttachResume,
                StepKind::Submit,
                StepKind::VerifyConfirmation,
            ]
        );
        assert_eq!(steps[3].retry.max_retries, 0);
    }
}
