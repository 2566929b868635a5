//! Reload scheduling with single-flight coalescing

use folio_common::{FolioError, Result};
use folio_config::SyncConfig;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Continuation of a caller waiting for the next completed reload
pub type ReloadWaiter = oneshot::Sender<Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Reloading,
    IdleWithPendingRetry,
}

/// Decides when the filter list is fetched
///
/// At most one fetch is in flight and at most one timer deadline is armed.
/// Waiters are drained exactly once per completed fetch.
#[derive(Debug)]
pub struct SyncScheduler {
    state: SchedulerState,
    waiters: Vec<ReloadWaiter>,
    deadline: Option<Instant>,
    follow_up: bool,
    refresh_interval: Duration,
    retry_window: (Duration, Duration),
}

impl SyncScheduler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: SchedulerState::Idle,
            waiters: Vec::new(),
            deadline: None,
            follow_up: false,
            refresh_interval: config.refresh_interval(),
            retry_window: config.reload_retry_window(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_reloading(&self) -> bool {
        self.state == SchedulerState::Reloading
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Arm the timer, replacing any previous deadline
    pub fn arm(&mut self, at: Instant) {
        self.cancel_timer();
        self.deadline = Some(at);
    }

    pub fn cancel_timer(&mut self) {
        self.deadline = None;
    }

    /// Explicit reload request; returns true when a fetch must be issued
    pub fn request(&mut self, waiter: Option<ReloadWaiter>) -> bool {
        if let Some(waiter) = waiter {
            self.waiters.push(waiter);
        }
        if self.state == SchedulerState::Reloading {
            tracing::debug!("Reload already in flight, {} waiting", self.waiters.len());
            return false;
        }
        self.cancel_timer();
        self.state = SchedulerState::Reloading;
        true
    }

    /// Server signalled that its list changed
    ///
    /// A fetch already in flight may predate the change, so another one
    /// follows it. Returns true when a fetch must be issued now.
    pub fn request_follow_up(&mut self) -> bool {
        if self.state == SchedulerState::Reloading {
            self.follow_up = true;
            return false;
        }
        self.request(None)
    }

    /// Fetch succeeded; returns true when a follow-up fetch must be issued
    pub fn on_success(&mut self, now: Instant) -> bool {
        for waiter in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Ok(()));
        }
        self.state = SchedulerState::Idle;
        self.arm(now + self.refresh_interval);
        if std::mem::take(&mut self.follow_up) {
            return self.request(None);
        }
        false
    }

    pub fn on_failure(&mut self, now: Instant, error: &FolioError) {
        for waiter in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.follow_up = false;
        self.state = SchedulerState::IdleWithPendingRetry;
        let delay = self.retry_delay();
        tracing::warn!("Filter reload failed: {}; retrying in {:?}", error, delay);
        self.arm(now + delay);
    }

    fn retry_delay(&self) -> Duration {
        let (min, max) = self.retry_window;
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// Timer check; returns true when the deadline passed and a fetch must be
    /// issued
    pub fn on_timer(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.request(None)
            }
            _ => false,
        }
    }

    /// Resolve every waiter with a cancellation and disarm the timer
    pub fn cancel_all(&mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(FolioError::Cancelled));
        }
        self.cancel_timer();
        self.follow_up = false;
        self.state = SchedulerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> SyncScheduler {
        SyncScheduler::new(&SyncConfig::default())
    }

    #[test]
    fn test_coalesces_concurrent_requests() {
        let mut scheduler = scheduler();
        let mut receivers = Vec::new();
        let mut fetches = 0;
        for _ in 0..5 {
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            if scheduler.request(Some(tx)) {
                fetches += 1;
            }
        }
        assert_eq!(fetches, 1);
        assert_eq!(scheduler.waiting(), 5);

        for rx in receivers.iter_mut() {
            assert!(rx.try_recv().is_err());
        }

        scheduler.on_success(Instant::now());
        for mut rx in receivers {
            assert_eq!(rx.try_recv().unwrap(), Ok(()));
        }
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_success_arms_refresh() {
        let mut scheduler = scheduler();
        let now = Instant::now();
        scheduler.request(None);
        assert!(scheduler.deadline().is_none());
        scheduler.on_success(now);
        assert_eq!(scheduler.deadline(), Some(now + Duration::from_secs(86_400)));
    }

    #[test]
    fn test_failure_resolves_waiters_and_backs_off() {
        let mut scheduler = scheduler();
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        scheduler.request(Some(tx));

        let error = FolioError::TransientServer("timeout".to_string());
        scheduler.on_failure(now, &error);

        assert_eq!(rx.try_recv().unwrap(), Err(error));
        assert_eq!(scheduler.state(), SchedulerState::IdleWithPendingRetry);
        let deadline = scheduler.deadline().unwrap();
        assert!(deadline >= now + Duration::from_secs(60));
        assert!(deadline <= now + Duration::from_secs(300));
    }

    #[test]
    fn test_request_cancels_pending_timer() {
        let mut scheduler = scheduler();
        scheduler.arm(Instant::now() + Duration::from_secs(10));
        assert!(scheduler.request(None));
        assert!(scheduler.deadline().is_none());
    }

    #[test]
    fn test_timer_fires_only_after_deadline() {
        let mut scheduler = scheduler();
        let now = Instant::now();
        scheduler.arm(now + Duration::from_secs(5));
        assert!(!scheduler.on_timer(now));
        assert!(scheduler.on_timer(now + Duration::from_secs(5)));
        assert!(scheduler.is_reloading());
    }

    #[test]
    fn test_follow_up_after_push_during_reload() {
        let mut scheduler = scheduler();
        assert!(scheduler.request(None));
        assert!(!scheduler.request_follow_up());
        assert!(scheduler.on_success(Instant::now()));
        assert!(scheduler.is_reloading());
        assert!(!scheduler.on_success(Instant::now()));
    }

    #[test]
    fn test_cancel_all() {
        let mut scheduler = scheduler();
        let (tx, mut rx) = oneshot::channel();
        scheduler.request(Some(tx));
        scheduler.cancel_all();
        assert_eq!(rx.try_recv().unwrap(), Err(FolioError::Cancelled));
        assert!(scheduler.deadline().is_none());
    }
}
