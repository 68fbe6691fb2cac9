use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;

use crate::error::TransportErrorKind;

/// How many re-issues a built-in retry behavior grants, and with what delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry the request once, immediately.
    RetryOnce,
    /// Retry immediately once, then once more after the given delay.
    RetryTwiceWithDelay(Duration),
}

impl RetryStrategy {
    fn verdict(self, attempt: u32) -> RetryVerdict {
        match self {
            Self::RetryOnce => {
                if attempt == 0 {
                    RetryVerdict::Retry {
                        delay: Duration::ZERO,
                    }
                } else {
                    RetryVerdict::DoNotRetry
                }
            }
            Self::RetryTwiceWithDelay(delay) => match attempt {
                0 => RetryVerdict::Retry {
                    delay: Duration::ZERO,
                },
                1 => RetryVerdict::Retry { delay },
                _ => RetryVerdict::DoNotRetry,
            },
        }
    }
}

/// What failed: a transport-level error, or an HTTP response whose status
/// the task's classification rules consider a failure. Parse errors are
/// never offered for retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    NetworkFailure { kind: TransportErrorKind },
    FailedStatus { status: StatusCode },
}

/// Inputs to a retry decision.
#[derive(Clone, Copy, Debug)]
pub struct RetryContext {
    /// Number of attempts already made beyond the first (0 on the first
    /// failure).
    pub attempt: u32,
    pub is_idempotent: bool,
    pub outcome: RetryOutcome,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryVerdict {
    DoNotRetry,
    Retry { delay: Duration },
}

type CustomHandler = Arc<dyn Fn(&RetryContext) -> RetryVerdict + Send + Sync>;

#[derive(Clone)]
enum BehaviorKind {
    NetworkFailure(RetryStrategy),
    NetworkFailureOrServiceUnavailable(RetryStrategy),
    Custom(CustomHandler),
}

/// Pluggable decision function evaluated on failure to decide whether, and
/// after what delay, a request is re-issued.
///
/// By default a behavior only fires for idempotent requests; use
/// [`ignoring_idempotence`](Self::ignoring_idempotence) to lift that.
#[derive(Clone)]
pub struct RetryBehavior {
    ignore_idempotence: bool,
    kind: BehaviorKind,
}

impl std::fmt::Debug for RetryBehavior {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            BehaviorKind::NetworkFailure(strategy) => format!("NetworkFailure({strategy:?})"),
            BehaviorKind::NetworkFailureOrServiceUnavailable(strategy) => {
                format!("NetworkFailureOrServiceUnavailable({strategy:?})")
            }
            BehaviorKind::Custom(_) => "Custom(..)".to_owned(),
        };
        formatter
            .debug_struct("RetryBehavior")
            .field("ignore_idempotence", &self.ignore_idempotence)
            .field("kind", &kind)
            .finish()
    }
}

impl RetryBehavior {
    /// Retries transport-level network failures.
    pub fn retry_network_failure(strategy: RetryStrategy) -> Self {
        Self {
            ignore_idempotence: false,
            kind: BehaviorKind::NetworkFailure(strategy),
        }
    }

    /// Retries transport-level network failures and gateway failures
    /// (HTTP 502, 503, 504).
    pub fn retry_network_failure_or_service_unavailable(strategy: RetryStrategy) -> Self {
        Self {
            ignore_idempotence: false,
            kind: BehaviorKind::NetworkFailureOrServiceUnavailable(strategy),
        }
    }

    /// Full custom control. The handler is invoked exactly once per failed
    /// attempt, on the task's worker context.
    pub fn custom<F>(handler: F) -> Self
    where
        F: Fn(&RetryContext) -> RetryVerdict + Send + Sync + 'static,
    {
        Self {
            ignore_idempotence: false,
            kind: BehaviorKind::Custom(Arc::new(handler)),
        }
    }

    /// Evaluates the behavior for non-idempotent requests too.
    pub fn ignoring_idempotence(mut self) -> Self {
        self.ignore_idempotence = true;
        self
    }

    pub(crate) fn evaluate(&self, context: &RetryContext) -> RetryVerdict {
        if !context.is_idempotent && !self.ignore_idempotence {
            return RetryVerdict::DoNotRetry;
        }
        match &self.kind {
            BehaviorKind::NetworkFailure(strategy) => match context.outcome {
                RetryOutcome::NetworkFailure { .. } => strategy.verdict(context.attempt),
                RetryOutcome::FailedStatus { .. } => RetryVerdict::DoNotRetry,
            },
            BehaviorKind::NetworkFailureOrServiceUnavailable(strategy) => match context.outcome {
                RetryOutcome::NetworkFailure { .. } => strategy.verdict(context.attempt),
                RetryOutcome::FailedStatus { status } => {
                    if matches!(status.as_u16(), 502 | 503 | 504) {
                        strategy.verdict(context.attempt)
                    } else {
                        RetryVerdict::DoNotRetry
                    }
                }
            },
            BehaviorKind::Custom(handler) => handler(context),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_context(attempt: u32, is_idempotent: bool) -> RetryContext {
        RetryContext {
            attempt,
            is_idempotent,
            outcome: RetryOutcome::NetworkFailure {
                kind: TransportErrorKind::Connect,
            },
        }
    }

    fn status_context(attempt: u32, status: u16) -> RetryContext {
        RetryContext {
            attempt,
            is_idempotent: true,
            outcome: RetryOutcome::FailedStatus {
                status: StatusCode::from_u16(status).expect("status code"),
            },
        }
    }

    #[test]
    fn retry_once_grants_exactly_one_extra_attempt() {
        let behavior = RetryBehavior::retry_network_failure(RetryStrategy::RetryOnce);
        assert_eq!(
            behavior.evaluate(&network_context(0, true)),
            RetryVerdict::Retry {
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            behavior.evaluate(&network_context(1, true)),
            RetryVerdict::DoNotRetry
        );
    }

    #[test]
    fn retry_twice_with_delay_applies_delay_on_second_retry() {
        let delay = Duration::from_millis(50);
        let behavior =
            RetryBehavior::retry_network_failure(RetryStrategy::RetryTwiceWithDelay(delay));
        assert_eq!(
            behavior.evaluate(&network_context(0, true)),
            RetryVerdict::Retry {
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            behavior.evaluate(&network_context(1, true)),
            RetryVerdict::Retry { delay }
        );
        assert_eq!(
            behavior.evaluate(&network_context(2, true)),
            RetryVerdict::DoNotRetry
        );
    }

    #[test]
    fn non_idempotent_requests_are_not_retried_by_default() {
        let behavior = RetryBehavior::retry_network_failure(RetryStrategy::RetryOnce);
        assert_eq!(
            behavior.evaluate(&network_context(0, false)),
            RetryVerdict::DoNotRetry
        );
        assert_eq!(
            behavior
                .ignoring_idempotence()
                .evaluate(&network_context(0, false)),
            RetryVerdict::Retry {
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn service_unavailable_behavior_covers_gateway_statuses_only() {
        let behavior = RetryBehavior::retry_network_failure_or_service_unavailable(
            RetryStrategy::RetryOnce,
        );
        assert_eq!(
            behavior.evaluate(&status_context(0, 503)),
            RetryVerdict::Retry {
                delay: Duration::ZERO
            }
        );
        assert_eq!(
            behavior.evaluate(&status_context(0, 500)),
            RetryVerdict::DoNotRetry
        );

        let plain = RetryBehavior::retry_network_failure(RetryStrategy::RetryOnce);
        assert_eq!(
            plain.evaluate(&status_context(0, 503)),
            RetryVerdict::DoNotRetry
        );
    }

    #[test]
    fn custom_handler_sees_the_full_context() {
        let behavior = RetryBehavior::custom(|context| {
            if context.attempt < 3 {
                RetryVerdict::Retry {
                    delay: Duration::from_millis(10),
                }
            } else {
                RetryVerdict::DoNotRetry
            }
        });
        assert_eq!(
            behavior.evaluate(&network_context(2, true)),
            RetryVerdict::Retry {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            behavior.evaluate(&network_context(3, true)),
            RetryVerdict::DoNotRetry
        );
    }
}
