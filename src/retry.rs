//! Retry decision for failed tasks: at most one automatic retry, then pause.

use crate::models::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Increment the retry budget and send the task back to pending.
    Retry,
    /// Budget exhausted: pause the task and raise the engine's paused flag.
    Pause,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    /// `max_retries` is clamped to the 0..=1 range the data model allows.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.min(1),
        }
    }

    pub fn decide(&self, task: &Task) -> RetryDecision {
        if (task.retry_count as u32) < self.max_retries {
            RetryDecision::Retry
        } else {
            RetryDecision::Pause
        }
    }

    /// Failure context carried into the brief for the next attempt.
    pub fn retry_context(&self, task: &Task, error: &str) -> String {
        let mut truncated = error;
        if truncated.len() > 2000 {
            let mut cut = 2000;
            while !truncated.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated = &truncated[..cut];
        }
        format!(
            "Previous attempt failed (attempt {}).\nError: {}\n\nAddress this error; take a different approach if needed.",
            task.retry_count + 1,
            truncated
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_RETRIES)
    }
}
