use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;

/// Admission gate releasing at most `rate` permits in any window of length
/// `window`. Each permit returns to the bucket exactly one window after it
/// was taken, so a burst can never exceed the ceiling.
#[derive(Debug)]
pub struct RateLimiter {
    rate: usize,
    window: Duration,
    issued: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(rate: usize, window: Duration) -> Self {
        let rate = rate.max(1);
        Self {
            rate,
            window,
            issued: Mutex::new(VecDeque::with_capacity(rate)),
        }
    }

    pub fn per_second(rate: usize) -> Self {
        Self::new(rate, Duration::from_secs(1))
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Ok if a permit is free now, taking it when `take` is set. Otherwise
    /// returns when the next one frees up.
    fn poll(&self, take: bool) -> Result<(), Instant> {
        let now = Instant::now();
        let mut issued = match self.issued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while issued
            .front()
            .is_some_and(|taken| now.duration_since(*taken) >= self.window)
        {
            issued.pop_front();
        }
        if issued.len() < self.rate {
            if take {
                issued.push_back(now);
            }
            return Ok(());
        }
        match issued.front() {
            Some(oldest) => Err(*oldest + self.window),
            None => Ok(()),
        }
    }

    async fn wait(&self, take: bool, cancel: &CancellationToken) -> Result<(), QueueError> {
        loop {
            let ready_at = match self.poll(take) {
                Ok(()) => return Ok(()),
                Err(at) => at,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = sleep_until(ready_at) => {}
            }
        }
    }

    /// Waits for a permit. Returns `Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.wait(true, cancel).await
    }

    /// Waits until a permit is free without taking it. With a single
    /// consumer the following `acquire` returns at once.
    pub async fn ready(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.wait(false, cancel).await
    }
}
