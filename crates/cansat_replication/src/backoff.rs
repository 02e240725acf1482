//! Exponential backoff scheduler.
//!
//! Decouples "the operation failed" from "when do we try again". A
//! [`BackoffScheduler`] holds at most one pending timer. When it expires the
//! scheduler emits [`BackoffEvent::Retry`] and bumps its attempt counter.
//! Observers receive events through unbounded channels handed out by
//! [`BackoffScheduler::subscribe`].
//!
//! Every `reset()` starts a new generation. Retry events carry the generation
//! they were armed in, so a consumer can drop a retry that was already queued
//! when the scheduler got reset.

use crate::config::BackoffConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notification emitted by a [`BackoffScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffEvent {
    /// A retry timer was armed.
    Waiting {
        /// 1-based number of the attempt the timer leads to.
        attempt: u32,
        /// Delay until the retry fires.
        delay: Duration,
    },
    /// The timer expired; the protected operation should be retried now.
    Retry {
        /// 1-based number of this attempt.
        attempt: u32,
        /// Generation the timer was armed in.
        generation: u64,
    },
    /// The protected operation succeeded.
    Succeeded,
}

/// Exponentially growing delays with multiplicative jitter.
#[derive(Debug, Clone)]
pub struct ExponentialStrategy {
    config: BackoffConfig,
    step: u32,
}

impl ExponentialStrategy {
    /// Creates a strategy at its initial step.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, step: 0 }
    }

    /// Returns the next delay and advances the strategy.
    pub fn next_delay(&mut self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen();
        let delay = self.config.delay_with_jitter(self.step, jitter);
        self.step = self.step.saturating_add(1);
        delay
    }

    /// Returns the strategy to its initial step.
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn step(&self) -> u32 {
        self.step
    }

    /// The strategy configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

struct SchedulerInner {
    strategy: ExponentialStrategy,
    attempt: u32,
    generation: u64,
    pending: Option<JoinHandle<()>>,
    observers: Vec<mpsc::UnboundedSender<BackoffEvent>>,
}

impl SchedulerInner {
    fn emit(&mut self, event: BackoffEvent) {
        self.observers.retain(|observer| observer.send(event).is_ok());
    }

    fn cancel_pending(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.abort();
        }
    }

    fn fire(this: &Mutex<SchedulerInner>, generation: u64) {
        let mut inner = this.lock();
        if inner.generation != generation || inner.pending.is_none() {
            return;
        }

        inner.pending = None;
        let attempt = inner.attempt.saturating_add(1);
        inner.emit(BackoffEvent::Retry {
            attempt,
            generation,
        });
        inner.attempt = attempt;
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Schedules retries with exponential backoff.
///
/// Cloning is cheap; clones share the same timer, counter and observers.
/// Arming a timer spawns a Tokio task, so [`schedule_backoff`] must be called
/// from within a Tokio runtime.
///
/// [`schedule_backoff`]: BackoffScheduler::schedule_backoff
#[derive(Clone)]
pub struct BackoffScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl BackoffScheduler {
    /// Creates an idle scheduler.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                strategy: ExponentialStrategy::new(config),
                attempt: 0,
                generation: 0,
                pending: None,
                observers: Vec::new(),
            })),
        }
    }

    /// Registers an observer for scheduler events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BackoffEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().observers.push(tx);
        rx
    }

    /// Arms a retry timer unless one is already pending.
    ///
    /// Returns `false` when the call was coalesced into a pending timer.
    pub fn schedule_backoff(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending.is_some() {
            return false;
        }

        let delay = inner.strategy.next_delay();
        let attempt = inner.attempt.saturating_add(1);
        let generation = inner.generation;
        let weak: Weak<Mutex<SchedulerInner>> = Arc::downgrade(&self.inner);

        inner.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SchedulerInner::fire(&inner, generation);
            }
        }));
        inner.emit(BackoffEvent::Waiting { attempt, delay });
        true
    }

    /// Cancels any pending timer and zeroes the attempt counter.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.cancel_pending();
        inner.generation = inner.generation.wrapping_add(1);
        inner.attempt = 0;
        inner.strategy.reset();
    }

    /// Signals that the retried operation worked.
    ///
    /// Same as [`reset`](Self::reset) but also emits [`BackoffEvent::Succeeded`].
    pub fn success(&self) {
        self.reset();
        self.inner.lock().emit(BackoffEvent::Succeeded);
    }

    /// Retries fired since the last reset.
    pub fn attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    /// Whether a retry timer is armed.
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    /// Current generation. Incremented by every reset.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

impl std::fmt::Debug for BackoffScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BackoffScheduler")
            .field("attempt", &inner.attempt)
            .field("generation", &inner.generation)
            .field("pending", &inner.pending.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn strategy_grows_and_resets() {
        let mut strategy = ExponentialStrategy::new(config());

        let first = strategy.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(130));

        let second = strategy.next_delay();
        assert!(second >= Duration::from_millis(200));
        assert!(second <= Duration::from_millis(260));
        assert_eq!(strategy.step(), 2);

        strategy.reset();
        assert_eq!(strategy.step(), 0);
        assert!(strategy.next_delay() <= Duration::from_millis(130));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_then_retry() {
        let scheduler = BackoffScheduler::new(config());
        let mut events = scheduler.subscribe();

        assert!(scheduler.schedule_backoff());
        assert!(scheduler.is_pending());

        match events.recv().await {
            Some(BackoffEvent::Waiting { attempt, delay }) => {
                assert_eq!(attempt, 1);
                assert!(delay >= Duration::from_millis(100));
            }
            other => panic!("expected waiting, got {:?}", other),
        }

        assert_eq!(
            events.recv().await,
            Some(BackoffEvent::Retry {
                attempt: 1,
                generation: 0
            })
        );
        assert_eq!(scheduler.attempt(), 1);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_timer_coalesces() {
        let scheduler = BackoffScheduler::new(config());
        let mut events = scheduler.subscribe();

        assert!(scheduler.schedule_backoff());
        assert!(!scheduler.schedule_backoff());
        assert!(!scheduler.schedule_backoff());

        assert!(matches!(
            events.recv().await,
            Some(BackoffEvent::Waiting { attempt: 1, .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(BackoffEvent::Retry { attempt: 1, .. })
        ));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(scheduler.attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_accumulate_until_reset() {
        let scheduler = BackoffScheduler::new(config());
        let mut events = scheduler.subscribe();

        for expected in 1..=3 {
            scheduler.schedule_backoff();
            assert!(matches!(
                events.recv().await,
                Some(BackoffEvent::Waiting { attempt, .. }) if attempt == expected
            ));
            assert!(matches!(
                events.recv().await,
                Some(BackoffEvent::Retry { attempt, .. }) if attempt == expected
            ));
        }
        assert_eq!(scheduler.attempt(), 3);

        scheduler.reset();
        assert_eq!(scheduler.attempt(), 0);
        assert_eq!(scheduler.generation(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_timer() {
        let scheduler = BackoffScheduler::new(config());
        let mut events = scheduler.subscribe();

        scheduler.schedule_backoff();
        scheduler.reset();
        scheduler.reset();
        assert!(!scheduler.is_pending());

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(matches!(
            events.try_recv(),
            Ok(BackoffEvent::Waiting { .. })
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(scheduler.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_and_notifies() {
        let scheduler = BackoffScheduler::new(config());
        let mut events = scheduler.subscribe();

        scheduler.schedule_backoff();
        let _ = events.recv().await;
        let _ = events.recv().await;
        assert_eq!(scheduler.attempt(), 1);

        scheduler.schedule_backoff();
        let _ = events.recv().await;
        scheduler.success();

        assert_eq!(events.recv().await, Some(BackoffEvent::Succeeded));
        assert_eq!(scheduler.attempt(), 0);
        assert!(!scheduler.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_observers_are_pruned() {
        let scheduler = BackoffScheduler::new(config());
        let dropped = scheduler.subscribe();
        drop(dropped);
        let mut kept = scheduler.subscribe();

        scheduler.schedule_backoff();
        assert!(matches!(kept.recv().await, Some(BackoffEvent::Waiting { .. })));
        assert_eq!(scheduler.inner.lock().observers.len(), 1);
    }
}
