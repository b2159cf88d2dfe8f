//! A small retry-with-backoff helper: a typed config plus a function that retries
//! an async operation up to `max_attempts` times with a multiplicatively growing
//! delay, stopping early when the predicate says the error is not retriable.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            multiplier: 2.0,
        }
    }
}

pub async fn with_retries<T, E, F, Fut>(
    config: &RetryConfig,
    is_retriable: impl Fn(&E) -> bool,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = config.min_delay;
    let mut last_err = None;
    for attempt_no in 0..config.max_attempts.max(1) {
        match attempt(attempt_no).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt_no + 1 >= config.max_attempts || !is_retriable(&err) {
                    last_err = Some(err);
                    break;
                }
                last_err = Some(err);
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(config.multiplier);
            }
        }
    }
    Err(last_err.expect("at least one attempt is always made"))
}
