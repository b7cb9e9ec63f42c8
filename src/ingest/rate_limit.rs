//! Adapter-local backoff bookkeeping.
//!
//! Each adapter owns one `RateLimiter`: a token bucket sized from the
//! provider's requests-per-minute budget, plus a cooldown set whenever the
//! provider answers 429. No coordination happens across adapters.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    max_tokens: f64,
    /// tokens per second
    refill_rate: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn time_until_token(&self) -> Duration {
        if self.tokens >= 1.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `per_minute` requests, bursting up to the same amount.
    pub fn per_minute(per_minute: u32) -> Self {
        let max = f64::from(per_minute.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                tokens: max,
                max_tokens: max,
                refill_rate: max / 60.0,
                last_refill: Instant::now(),
                cooldown_until: None,
            }),
        }
    }

    /// Take one token, waiting at most `max_wait`.
    ///
    /// Returns `Err(retry_after_secs)` when a provider cooldown is active or
    /// the next token is further away than `max_wait`.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), u64> {
        let wait = {
            let mut b = self.bucket.lock().await;
            let now = Instant::now();
            if let Some(until) = b.cooldown_until {
                if until > now {
                    return Err(ceil_secs(until - now));
                }
                b.cooldown_until = None;
            }
            b.refill(now);
            if b.tokens >= 1.0 {
                b.tokens -= 1.0;
                return Ok(());
            }
            b.time_until_token()
        };

        if wait > max_wait {
            return Err(ceil_secs(wait));
        }
        tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiter: waiting for token");
        tokio::time::sleep(wait).await;

        let mut b = self.bucket.lock().await;
        b.refill(Instant::now());
        b.tokens = (b.tokens - 1.0).max(0.0);
        Ok(())
    }

    /// Record a provider-imposed pause (HTTP 429 Retry-After).
    pub async fn cool_down(&self, retry_after: Duration) {
        let mut b = self.bucket.lock().await;
        let until = Instant::now() + retry_after;
        b.cooldown_until = Some(match b.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        b.tokens = 0.0;
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_refuses_without_waiting() {
        let rl = RateLimiter::per_minute(2);
        assert!(rl.acquire(Duration::ZERO).await.is_ok());
        assert!(rl.acquire(Duration::ZERO).await.is_ok());
        // next token is 30s away
        let err = rl.acquire(Duration::from_secs(1)).await.unwrap_err();
        assert!((30..=31).contains(&err), "retry after {err}s");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_token_within_budget() {
        let rl = RateLimiter::per_minute(60);
        for _ in 0..60 {
            rl.acquire(Duration::ZERO).await.unwrap();
        }
        let started = Instant::now();
        rl.acquire(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_blocks_until_elapsed() {
        let rl = RateLimiter::per_minute(100);
        rl.cool_down(Duration::from_secs(20)).await;
        assert_eq!(rl.acquire(Duration::from_secs(60)).await, Err(20));
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(rl.acquire(Duration::from_secs(60)).await.is_ok());
    }
}
