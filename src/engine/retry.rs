//! Step retry transitions and backoff computation.

use crate::definition::BackoffStrategy;
use crate::model::{StepStatus, WorkflowStep};

/// Backoff is capped so a misconfigured step cannot stall a workflow for
/// minutes between attempts.
pub const MAX_BACKOFF_SECONDS: f64 = 60.0;

/// Compute the delay before the next launch of a retried step.
pub fn compute_retry_backoff_seconds(
    retry_count: u32,
    strategy: BackoffStrategy,
    initial_delay: f64,
    default_base: f64,
) -> f64 {
    let base = if initial_delay > 0.0 {
        initial_delay
    } else {
        default_base
    };
    match strategy {
        BackoffStrategy::Linear => (base * retry_count as f64).min(MAX_BACKOFF_SECONDS),
        BackoffStrategy::Constant => base,
        BackoffStrategy::Exponential => {
            (base * 2f64.powi(retry_count.saturating_sub(1) as i32)).min(MAX_BACKOFF_SECONDS)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryTransition {
    pub will_retry: bool,
    pub backoff_seconds: Option<f64>,
    pub max_retries: u32,
}

/// Apply the retry transition to a failed step.
///
/// When retries remain the step returns to `pending` with its completion
/// timestamp and error cleared, ready for relaunch after the returned
/// backoff. When the budget is exhausted the step is marked `failed` and
/// the caller fails the workflow.
pub fn apply_retry_transition(step: &mut WorkflowStep, default_base: f64) -> RetryTransition {
    let max_retries = step.effective_max_retries;
    if step.retry_count >= max_retries {
        step.status = StepStatus::Failed;
        return RetryTransition {
            will_retry: false,
            backoff_seconds: None,
            max_retries,
        };
    }

    step.retry_count += 1;
    step.status = StepStatus::Pending;
    step.completed_at = None;
    step.error = None;
    let backoff = compute_retry_backoff_seconds(
        step.retry_count,
        step.backoff_strategy,
        step.initial_delay_seconds,
        default_base,
    );
    RetryTransition {
        will_retry: true,
        backoff_seconds: Some(backoff),
        max_retries,
    }
}
