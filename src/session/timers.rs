use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Deadline used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    SleepStop,
    AlarmTrigger,
}

/// Identity of one arming of a timer. A fire event carrying an id that is no
/// longer live is stale and must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct ArmedTimer {
    id: TimerId,
    deadline: Instant,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ArmedTimer {
    fn cancel(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// The two one-shot timers a session owns.
pub struct TimerSet {
    next_id: u64,
    sleep_stop: Option<ArmedTimer>,
    alarm_trigger: Option<ArmedTimer>,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            sleep_stop: None,
            alarm_trigger: None,
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::SleepStop => &mut self.sleep_stop,
            TimerKind::AlarmTrigger => &mut self.alarm_trigger,
        }
    }

    fn slot_ref(&self, kind: TimerKind) -> Option<&ArmedTimer> {
        match kind {
            TimerKind::SleepStop => self.sleep_stop.as_ref(),
            TimerKind::AlarmTrigger => self.alarm_trigger.as_ref(),
        }
    }

    /// Arm `kind` to run `on_fire` after `delay`, replacing any live timer of
    /// the same kind. `on_fire` receives the id it was armed with and is
    /// expected to check it with [`take_if_live`](Self::take_if_live).
    pub fn arm<F, Fut>(&mut self, kind: TimerKind, delay: Duration, on_fire: F) -> TimerId
    where
        F: FnOnce(TimerId) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(kind);

        self.next_id = self.next_id.wrapping_add(1);
        let id = TimerId(self.next_id);
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {}
                _ = time::sleep(delay) => on_fire(id).await,
            }
        });

        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);

        debug!("armed {kind:?} timer {id:?} for {delay:?}");
        *self.slot(kind) = Some(ArmedTimer {
            id,
            deadline,
            token,
            handle,
        });
        id
    }

    /// Idempotent. Returns whether a live timer was cancelled.
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.slot(kind).take() {
            Some(timer) => {
                debug!("cancelled {kind:?} timer {:?}", timer.id);
                timer.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.cancel(TimerKind::SleepStop);
        self.cancel(TimerKind::AlarmTrigger);
    }

    /// Consume the fire of timer `id`. Returns false when that arming was
    /// cancelled or replaced, in which case the caller must do nothing.
    ///
    /// The slot is released without aborting the task, because the caller is
    /// normally running inside that very task.
    pub fn take_if_live(&mut self, kind: TimerKind, id: TimerId) -> bool {
        let live = matches!(self.slot_ref(kind), Some(timer) if timer.id == id);
        if live {
            *self.slot(kind) = None;
        }
        live
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slot_ref(kind).is_some()
    }

    pub fn remaining(&self, kind: TimerKind) -> Option<Duration> {
        self.slot_ref(kind)
            .map(|timer| timer.deadline.saturating_duration_since(Instant::now()))
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce(TimerId) -> std::future::Ready<()> {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();
        timers.arm(TimerKind::SleepStop, Duration::from_secs(10), counting(&fired));

        time::sleep(Duration::from_secs(9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timers.remaining(TimerKind::SleepStop), Some(Duration::from_secs(1)));

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();
        timers.arm(TimerKind::AlarmTrigger, Duration::from_secs(5), counting(&fired));

        assert!(timers.cancel(TimerKind::AlarmTrigger));
        assert!(!timers.cancel(TimerKind::AlarmTrigger));
        assert!(!timers.is_armed(TimerKind::AlarmTrigger));

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();
        let first = timers.arm(TimerKind::SleepStop, Duration::from_secs(5), counting(&fired));
        let second = timers.arm(TimerKind::SleepStop, Duration::from_secs(20), counting(&fired));
        assert_ne!(first, second);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(!timers.take_if_live(TimerKind::SleepStop, first));
        assert!(timers.take_if_live(TimerKind::SleepStop, second));
        assert!(!timers.take_if_live(TimerKind::SleepStop, second));
    }

    #[tokio::test(start_paused = true)]
    async fn kinds_are_independent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();
        timers.arm(TimerKind::SleepStop, Duration::from_secs(5), counting(&fired));
        timers.arm(TimerKind::AlarmTrigger, Duration::from_secs(5), counting(&fired));
        timers.cancel(TimerKind::SleepStop);

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_delay_stays_armed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();
        timers.arm(TimerKind::SleepStop, Duration::MAX, counting(&fired));

        time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.remaining(TimerKind::SleepStop).unwrap() > Duration::from_secs(86_400));
    }
}
