//! Re-drives a paginated fetch from scratch on retryable failure, under a
//! global time budget.
//!
//! Each attempt fully re-invokes the producer and forwards its batches as
//! they arrive. Batches already forwarded by a failed attempt are not rolled
//! back; producers that are not idempotent per attempt must not use this
//! wrapper.

use crate::fetch::rate_limit::RateLimiter;
use crate::fetch::{Batch, BatchStream};
use crate::{Error, Result};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Exponential backoff bounds for one retry loop.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Global budget for the whole call, attempts and sleeps included.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Called with each retryable error before the sleep; returning an error
/// terminates the retry loop with that error (callback failures are not
/// swallowed).
pub type ErrorCallback = Box<dyn Fn(&Error) -> Result<()> + Send + Sync>;

/// Decorrelated-jitter sleep sequence: each draw is `uniform(0, delay)`,
/// after which `delay = min(delay * multiplier, max)`. Infinite by
/// construction; reaching its end is a programming error.
struct SleepSchedule {
    delay: Duration,
    max: Duration,
    multiplier: f64,
}

impl SleepSchedule {
    fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay.min(config.max_delay),
            max: config.max_delay,
            multiplier: config.multiplier,
        }
    }
}

impl Iterator for SleepSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let sleep = self.delay.mul_f64(rand::random::<f64>());
        let next = self.delay.as_secs_f64() * self.multiplier;
        self.delay = if next >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(next)
        };
        Some(sleep)
    }
}

/// Wrap `producer` in a retrying stream.
///
/// A non-retryable error propagates immediately. A retryable one is
/// accumulated; once `elapsed + next_sleep` would exceed the budget, the
/// stream yields `Error::RetryTimeout` carrying every accumulated error.
/// Dropping the returned stream mid-attempt schedules no further retries.
/// When a `limiter` is given, each attempt acquires a permit before invoking
/// the producer; rate-limit waiting counts against the budget like any other
/// latency.
#[tracing::instrument(level = "debug", skip_all)]
pub fn retry_paginated<P, R>(
    producer: P,
    is_retryable: R,
    config: RetryConfig,
    on_error: Option<ErrorCallback>,
    limiter: Option<Arc<RateLimiter>>,
) -> BatchStream
where
    P: Fn() -> BatchStream + Send + 'static,
    R: Fn(&Error) -> bool + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Batch>>(1);

    tokio::spawn(async move {
        let started = Instant::now();
        let mut schedule = SleepSchedule::new(&config);
        let mut errors: Vec<Error> = Vec::new();
        let mut attempts = 0usize;

        'attempt: loop {
            attempts += 1;
            if let Some(limiter) = &limiter {
                limiter.acquire().await;
            }
            let mut stream = producer();

            loop {
                match stream.next().await {
                    Some(Ok(batch)) => {
                        if tx.send(Ok(batch)).await.is_err() {
                            // Consumer cancelled mid-attempt.
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        if !is_retryable(&err) {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                        if let Some(callback) = &on_error {
                            if let Err(callback_err) = callback(&err) {
                                errors.push(err);
                                let _ = tx.send(Err(callback_err)).await;
                                return;
                            }
                        }
                        errors.push(err);

                        let sleep = schedule
                            .next()
                            .expect("sleep schedule is infinite by construction");
                        if started.elapsed() + sleep > config.timeout {
                            let _ = tx
                                .send(Err(Error::RetryTimeout {
                                    timeout: config.timeout,
                                    attempts,
                                    errors: std::mem::take(&mut errors),
                                }))
                                .await;
                            return;
                        }
                        tracing::warn!(
                            attempt = attempts,
                            sleep_ms = sleep.as_millis() as u64,
                            "paginated fetch failed; retrying from the first page"
                        );
                        tokio::time::sleep(sleep).await;
                        continue 'attempt;
                    }
                    None => return,
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}
