use tokio::sync::broadcast;

use crate::ports::{InterruptionEvent, InterruptionSource};

/// Interruption signals raised by hand, e.g. from the shell's `interrupt`
/// and `resume` commands.
pub struct ManualInterruptionSource {
    tx: broadcast::Sender<InterruptionEvent>,
}

impl Default for ManualInterruptionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualInterruptionSource {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn begin(&self) {
        self.emit(InterruptionEvent::Began);
    }

    pub fn end(&self, should_resume: bool) {
        self.emit(InterruptionEvent::Ended { should_resume });
    }

    fn emit(&self, event: InterruptionEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("interruption {event:?} had no listeners");
        }
    }
}

impl InterruptionSource for ManualInterruptionSource {
    fn subscribe(&self) -> broadcast::Receiver<InterruptionEvent> {
        self.tx.subscribe()
    }
}
