//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::GuidStoreError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports re-arming
/// with a different duration for implementing incremental backoff, etc.
///
/// An unarmed timer never fires. Firing disarms the timer.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Whether the timer is currently armed.
    armed: bool,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a new unarmed timer.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            armed: false,
            last_dur: Duration::ZERO,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Whether the timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arms (or re-arms) the timer with the given duration.
    pub fn kickoff(&mut self, dur: Duration) -> Result<(), GuidStoreError> {
        if dur.is_zero() {
            return Err(GuidStoreError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Disarms the timer.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`. Pends forever if not armed.
    pub async fn timeout(&mut self) {
        if !self.armed {
            futures::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new();
        assert!(timer.get_dur().is_zero());
        assert!(!timer.is_armed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_unarmed_pends() {
        let mut timer = Timer::new();
        let fired =
            time::timeout(Duration::from_millis(100), timer.timeout()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_kickoff_backoff() -> Result<(), GuidStoreError> {
        let mut timer = Timer::new();
        let mut start = Instant::now();
        timer.kickoff(Duration::from_millis(150))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(!timer.is_armed());
        // incremental backoff
        start = Instant::now();
        timer.kickoff(timer.get_dur() * 2)?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(timer.get_dur(), Duration::from_millis(300));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() -> Result<(), GuidStoreError> {
        let mut timer = Timer::new();
        timer.kickoff(Duration::from_millis(50))?;
        timer.cancel();
        let fired =
            time::timeout(Duration::from_millis(150), timer.timeout()).await;
        assert!(fired.is_err());
        assert!(timer.kickoff(Duration::ZERO).is_err());
        Ok(())
    }
}
