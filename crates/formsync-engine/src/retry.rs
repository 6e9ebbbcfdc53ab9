use formsync_core::contracts::{FailureClass, SourceError, TargetError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub linear_step: Duration,
    pub exponential_base: f64,
    pub exponential_step: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            linear_step: Duration::from_secs(1),
            exponential_base: 2.0,
            exponential_step: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the zero-based `attempt` failed, or `None` when the error is
    /// terminal or the attempt ceiling is reached.
    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }
        match class {
            FailureClass::Connection => Some(self.linear_delay(attempt)),
            FailureClass::Throttled => Some(self.exponential_delay(attempt)),
            FailureClass::Permanent => None,
        }
    }

    pub fn linear_delay(&self, attempt: u32) -> Duration {
        self.linear_step
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }

    /// `base^attempt` seconds plus a small per-attempt step.
    pub fn exponential_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let seconds = self.exponential_base.powi(exponent);
        let delay = Duration::from_secs_f64(seconds.min(self.max_delay.as_secs_f64()))
            + self.exponential_step.saturating_mul(attempt);
        delay.min(self.max_delay)
    }
}

pub fn classify_source(err: &SourceError) -> FailureClass {
    if err.is_transient() {
        FailureClass::Connection
    } else {
        FailureClass::Permanent
    }
}

pub fn classify_target(err: &TargetError) -> FailureClass {
    err.class()
}

/// Runs `call` until it succeeds or the policy gives up on the classified error.
pub async fn retry_with<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    classify: C,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureClass,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                let Some(delay) = policy.delay_for(class, attempt) else {
                    return Err(err);
                };
                warn!(
                    event = "call_retry",
                    operation,
                    attempt = attempt + 1,
                    class = class.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Decides whether a failed batch gets another whole-batch round. The first round is the initial
/// submission; at most `max_extra_rounds` follow it. A retry round whose failure count is not
/// lower than the round before it ends retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRounds {
    max_extra_rounds: usize,
    rounds_run: usize,
    previous_failed: Option<usize>,
}

impl BatchRounds {
    pub fn new(max_extra_rounds: usize) -> Self {
        Self {
            max_extra_rounds,
            rounds_run: 0,
            previous_failed: None,
        }
    }

    pub fn rounds_run(&self) -> usize {
        self.rounds_run
    }

    /// Records a finished round and returns whether another should run.
    pub fn record_round(&mut self, failed: usize) -> bool {
        self.rounds_run += 1;
        let stalled = self
            .previous_failed
            .map(|previous| failed >= previous)
            .unwrap_or(false);
        self.previous_failed = Some(failed);

        if failed == 0 || stalled {
            return false;
        }
        self.rounds_run - 1 < self.max_extra_rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays_are_non_decreasing_up_to_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 8,
            ..RetryPolicy::default()
        };
        let delays: Vec<Duration> = (0..policy.max_attempts)
            .map_while(|attempt| policy.delay_for(FailureClass::Throttled, attempt))
            .collect();

        assert_eq!(delays.len(), 7);
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_millis(2500));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|delay| *delay <= policy.max_delay));
    }

    #[test]
    fn linear_delays_grow_by_step() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(FailureClass::Connection, 0),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.delay_for(FailureClass::Connection, 1),
            Some(Duration::from_secs(2))
        );
        assert_eq!(policy.delay_for(FailureClass::Connection, 2), None);
    }

    #[test]
    fn permanent_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(FailureClass::Permanent, 0), None);
    }

    #[test]
    fn batch_rounds_stop_without_progress() {
        let mut rounds = BatchRounds::new(3);
        assert!(rounds.record_round(10));
        assert!(!rounds.record_round(10));
        assert_eq!(rounds.rounds_run(), 2);
    }

    #[test]
    fn batch_rounds_continue_while_progressing_up_to_limit() {
        let mut rounds = BatchRounds::new(3);
        assert!(rounds.record_round(10));
        assert!(rounds.record_round(7));
        assert!(rounds.record_round(4));
        assert!(!rounds.record_round(2));
        assert_eq!(rounds.rounds_run(), 4);
    }

    #[test]
    fn batch_rounds_stop_when_everything_succeeds() {
        let mut rounds = BatchRounds::new(3);
        assert!(!rounds.record_round(0));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_gives_up_after_attempt_ceiling() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TargetError> = retry_with(
            &RetryPolicy::default(),
            "upload",
            classify_target,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TargetError::Status {
                        status: 429,
                        message: "slow down".to_string(),
                    })
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with(&RetryPolicy::default(), "fetch", classify_source, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(SourceError::Network("reset".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
