//! Global admission control for calls to the image provider.
//!
//! A sliding-window log: at most `capacity` grants inside any `window`-long
//! span. Waiters pass through a fair async mutex, so the longest waiter is
//! always served first.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;

use crate::errors::ErrorKind;

pub const WINDOW: Duration = Duration::from_secs(60);

/// Permission to make one provider call.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionToken {
    pub granted_at: Instant,
}

#[derive(Debug)]
struct SlidingWindow {
    grants: VecDeque<Instant>,
    capacity: usize,
    window: Duration,
}

impl SlidingWindow {
    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.grants.front() {
            if now.duration_since(oldest) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Grants now, or returns the instant the next grant becomes possible.
    fn try_grant(&mut self, now: Instant) -> Result<AdmissionToken, Instant> {
        self.evict(now);
        if self.grants.len() < self.capacity {
            self.grants.push_back(now);
            return Ok(AdmissionToken { granted_at: now });
        }
        // Full: the oldest grant leaves the window first.
        let oldest = self.grants.front().copied().unwrap_or(now);
        Err(oldest + self.window)
    }
}

pub struct AdmissionController {
    turnstile: tokio::sync::Mutex<()>,
    window: Mutex<SlidingWindow>,
}

impl AdmissionController {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_window(requests_per_minute, WINDOW)
    }

    pub fn with_window(capacity: u32, window: Duration) -> Self {
        Self {
            turnstile: tokio::sync::Mutex::new(()),
            window: Mutex::new(SlidingWindow {
                grants: VecDeque::with_capacity(capacity as usize),
                capacity: capacity.max(1) as usize,
                window,
            }),
        }
    }

    /// Waits as long as it takes for a token.
    pub async fn acquire(&self) -> AdmissionToken {
        let _turn = self.turnstile.lock().await;
        loop {
            let next = match self.window.lock().try_grant(Instant::now()) {
                Ok(token) => return token,
                Err(next) => next,
            };
            debug!(
                "Admission window full, waiting {:?}",
                next.saturating_duration_since(Instant::now())
            );
            sleep_until(next).await;
        }
    }

    /// Waits for a token only while one can be granted by `deadline`.
    /// Fails fast with `RateLimitExceeded` when the window will still be full
    /// at the deadline; no token is consumed in that case.
    pub async fn try_acquire(&self, deadline: Instant) -> Result<AdmissionToken, ErrorKind> {
        let _turn = timeout_at(deadline, self.turnstile.lock())
            .await
            .map_err(|_| ErrorKind::RateLimitExceeded)?;
        loop {
            let next = match self.window.lock().try_grant(Instant::now()) {
                Ok(token) => return Ok(token),
                Err(next) => next,
            };
            if next > deadline {
                return Err(ErrorKind::RateLimitExceeded);
            }
            sleep_until(next).await;
        }
    }

    /// Grants issued inside the current window.
    pub fn requests_in_window(&self) -> usize {
        let mut window = self.window.lock();
        window.evict(Instant::now());
        window.grants.len()
    }

    pub fn capacity(&self) -> usize {
        self.window.lock().capacity
    }
}
