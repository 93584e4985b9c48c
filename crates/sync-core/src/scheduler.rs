//! Throttles sync triggers into a single `start_sync` signal, and carries
//! the enable/disable and cancel/resume signals the queue listens on
//! (spec.md §4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::SyncConfig;

const SIGNAL_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    /// Shared by `notify_data_changed` and `request_sync_immediately`
    /// (spec.md §4.7: "data-changed and immediate triggers debounce to at
    /// most one emission per 1 second").
    Immediate,
    Lifecycle,
}

struct LaneState {
    window: Duration,
    last_emitted_at: Option<Instant>,
}

impl LaneState {
    /// Leading-edge throttle: the first trigger in a window fires
    /// immediately; later triggers within the same window are coalesced.
    /// This is "emit the latest within each window", not a trailing-edge
    /// debounce that fires late (spec.md §4.7).
    fn should_emit(&mut self, now: Instant) -> bool {
        match self.last_emitted_at {
            Some(last) if now.duration_since(last) < self.window => false,
            _ => {
                self.last_emitted_at = Some(now);
                true
            }
        }
    }
}

/// Single-threaded cooperative scheduler (spec.md §4.7). Input handlers and
/// output emissions stay on the caller's thread; throttling state lives
/// behind a short-held `Mutex`, not a dedicated task, since each handler
/// only compares and stamps an `Instant`.
pub struct Scheduler {
    enabled: AtomicBool,
    immediate: Mutex<LaneState>,
    lifecycle: Mutex<LaneState>,
    start_sync_tx: broadcast::Sender<()>,
    cancel_sync_tx: broadcast::Sender<()>,
    resume_sync_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(config: &SyncConfig) -> Self {
        let (start_sync_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let (cancel_sync_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let (resume_sync_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Scheduler {
            enabled: AtomicBool::new(true),
            immediate: Mutex::new(LaneState {
                window: config.immediate_debounce,
                last_emitted_at: None,
            }),
            lifecycle: Mutex::new(LaneState {
                window: config.lifecycle_debounce,
                last_emitted_at: None,
            }),
            start_sync_tx,
            cancel_sync_tx,
            resume_sync_tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn subscribe_start_sync(&self) -> broadcast::Receiver<()> {
        self.start_sync_tx.subscribe()
    }

    pub fn subscribe_cancel_sync(&self) -> broadcast::Receiver<()> {
        self.cancel_sync_tx.subscribe()
    }

    pub fn subscribe_resume_sync(&self) -> broadcast::Receiver<()> {
        self.resume_sync_tx.subscribe()
    }

    fn trigger(&self, lane: Lane) {
        if !self.is_enabled() {
            return;
        }
        let lane_state = match lane {
            Lane::Immediate => &self.immediate,
            Lane::Lifecycle => &self.lifecycle,
        };
        let should_emit = {
            let mut guard = lane_state.lock().expect("scheduler lane lock poisoned");
            guard.should_emit(Instant::now())
        };
        if should_emit {
            // No subscribers is not an error: the scheduler may run ahead
            // of the queue wiring up during startup.
            let _ = self.start_sync_tx.send(());
        }
    }

    /// Input: a feature reported a local data change.
    pub fn notify_data_changed(&self) {
        self.trigger(Lane::Immediate);
    }

    /// Input: an app lifecycle event (foreground, launch, ...).
    pub fn notify_app_lifecycle_event(&self) {
        self.trigger(Lane::Lifecycle);
    }

    /// Input: an explicit immediate sync request, sharing the immediate
    /// lane's window with `notify_data_changed`.
    pub fn request_sync_immediately(&self) {
        self.trigger(Lane::Immediate);
    }

    /// Output: ask the queue to cancel its current operation, independent
    /// of `is_enabled` (spec.md §5).
    pub fn cancel_sync(&self) {
        let _ = self.cancel_sync_tx.send(());
    }

    /// Output: ask the queue to resume after a cancel.
    pub fn resume_sync(&self) {
        let _ = self.resume_sync_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn config() -> SyncConfig {
        SyncConfig::new("https://s.example", Environment::Production)
    }

    #[test]
    fn repeated_immediate_triggers_within_the_window_emit_once() {
        let scheduler = Scheduler::new(&config());
        let mut rx = scheduler.subscribe_start_sync();

        for _ in 0..5 {
            scheduler.notify_data_changed();
        }

        assert_eq!(rx.try_recv(), Ok(()));
        assert!(rx.try_recv().is_err(), "second emission should be coalesced");
    }

    #[test]
    fn disabled_scheduler_drops_triggers_silently() {
        let scheduler = Scheduler::new(&config());
        scheduler.set_enabled(false);
        let mut rx = scheduler.subscribe_start_sync();

        scheduler.notify_data_changed();
        scheduler.request_sync_immediately();
        scheduler.notify_app_lifecycle_event();

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn immediate_and_request_sync_share_one_window() {
        let scheduler = Scheduler::new(&config());
        let mut rx = scheduler.subscribe_start_sync();

        scheduler.notify_data_changed();
        scheduler.request_sync_immediately();

        assert_eq!(rx.try_recv(), Ok(()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_and_resume_are_independent_of_enabled_flag() {
        let scheduler = Scheduler::new(&config());
        scheduler.set_enabled(false);
        let mut cancel_rx = scheduler.subscribe_cancel_sync();
        let mut resume_rx = scheduler.subscribe_resume_sync();

        scheduler.cancel_sync();
        scheduler.resume_sync();

        assert_eq!(cancel_rx.try_recv(), Ok(()));
        assert_eq!(resume_rx.try_recv(), Ok(()));
    }
}
