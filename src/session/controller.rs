use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::journal::{AlarmSource, Journal, JournalStatus, SleepSessionRecord};
use crate::ports::{
    AudioPlayer, AudioRecorder, Clock, InterruptionEvent, InterruptionSource, NotificationAction,
    NotificationId, NotificationScheduler, Presenter,
};

use super::{
    events::{DiagnosticSource, SessionEvent, SessionSnapshot},
    rows::{build_rows, Row, RowKind},
    timers::{TimerId, TimerKind, TimerSet},
    AlarmTime, DisplayState, SessionState, SleepDuration,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Initial values and wording for a session screen.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sleep_duration: SleepDuration,
    pub sleep_duration_options: Vec<SleepDuration>,
    pub alarm_time: AlarmTime,
    pub alarm_title: String,
    pub alarm_message: String,
    /// Treat permissions as granted until a denial comes back.
    pub optimistic_permissions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sleep_duration: SleepDuration::default(),
            sleep_duration_options: SleepDuration::standard_options(),
            alarm_time: AlarmTime::default(),
            alarm_title: "Wake up!".into(),
            alarm_message: "Good morning! Time to get up.".into(),
            optimistic_permissions: false,
        }
    }
}

/// Collaborators injected into a [`SessionController`].
#[derive(Clone)]
pub struct SessionPorts {
    pub sleep_player: Arc<dyn AudioPlayer>,
    pub alarm_player: Arc<dyn AudioPlayer>,
    pub recorder: Arc<dyn AudioRecorder>,
    pub notifications: Arc<dyn NotificationScheduler>,
    pub presenter: Arc<dyn Presenter>,
    pub interruptions: Arc<dyn InterruptionSource>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Permissions {
    microphone: Option<bool>,
    notifications: Option<bool>,
}

impl Permissions {
    fn granted(&self, optimistic: bool) -> bool {
        if optimistic {
            self.microphone != Some(false) && self.notifications != Some(false)
        } else {
            self.microphone == Some(true) && self.notifications == Some(true)
        }
    }
}

enum JournalEntry {
    Started(SleepSessionRecord),
    Alarm {
        session_id: String,
        source: AlarmSource,
        at: DateTime<Utc>,
    },
    Finished {
        session_id: String,
        status: JournalStatus,
        at: DateTime<Utc>,
    },
}

type SharedCore = Arc<Mutex<SessionCore>>;
type WeakCore = Weak<Mutex<SessionCore>>;

/// Drives one sleep → record → alarm cycle at a time.
///
/// Cheap to clone; every clone talks to the same session. Each operation
/// runs as a single critical section, so a transition's cleanup and entry
/// actions are never interleaved with another event. Timer fires, wake
/// notification actions, interruption signals and alarm acknowledgements
/// all re-enter through the same lock, in arrival order.
///
/// Must be constructed inside a tokio runtime.
#[derive(Clone)]
pub struct SessionController {
    core: SharedCore,
    ports: SessionPorts,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
    _shutdown_guard: Arc<DropGuard>,
    journal_writer: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl SessionController {
    pub fn new(ports: SessionPorts, config: SessionConfig, journal: Option<Journal>) -> Self {
        let initial = snapshot_of(
            SessionState::Idle,
            false,
            &config.sleep_duration,
            &config.alarm_time,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        // Subscribe before anything can be delivered.
        let actions = ports.notifications.actions();
        let interruptions = ports.interruptions.subscribe();

        let (journal_tx, journal_writer) = match journal {
            Some(journal) => {
                let (tx, writer) = spawn_journal_writer(journal, events_tx.clone());
                (Some(tx), Some(writer))
            }
            None => (None, None),
        };

        let core = Arc::new_cyclic(|weak: &WeakCore| {
            Mutex::new(SessionCore {
                state: SessionState::Idle,
                sleep_duration: config.sleep_duration,
                alarm_time: config.alarm_time,
                permissions: Permissions::default(),
                running: false,
                resume_after_interruption: false,
                timers: TimerSet::new(),
                pending_notification: None,
                session_id: None,
                alarm_epoch: 0,
                alarm_prompt: None,
                config,
                ports: ports.clone(),
                journal_tx,
                snapshot_tx,
                events_tx: events_tx.clone(),
                self_ref: weak.clone(),
            })
        });

        let shutdown = CancellationToken::new();
        spawn_action_pump(Arc::downgrade(&core), actions, shutdown.clone());
        spawn_interruption_pump(Arc::downgrade(&core), interruptions, shutdown.clone());

        Self {
            core,
            ports,
            snapshot_rx,
            events_tx,
            _shutdown_guard: Arc::new(shutdown.clone().drop_guard()),
            shutdown,
            journal_writer: Arc::new(std::sync::Mutex::new(journal_writer)),
        }
    }

    pub async fn play(&self) {
        self.core.lock().await.play().await;
    }

    pub async fn pause(&self) {
        self.core.lock().await.pause();
    }

    /// Ask for microphone and notification access. The prompts are awaited
    /// without holding the session, so other events keep flowing meanwhile.
    pub async fn request_permissions(&self) -> bool {
        let (microphone, notifications) = tokio::join!(
            self.ports.recorder.request_permission(),
            self.ports.notifications.request_permission()
        );

        let mut core = self.core.lock().await;
        core.apply_permissions(microphone, notifications);
        core.permissions_granted()
    }

    pub async fn permissions_granted(&self) -> bool {
        self.core.lock().await.permissions_granted()
    }

    pub async fn did_select_sleep_timer_option(&self, sleep_duration: SleepDuration) {
        self.core.lock().await.select_sleep_duration(sleep_duration);
    }

    pub async fn did_select_alarm_time(&self, alarm_time: AlarmTime) {
        self.core.lock().await.select_alarm_time(alarm_time);
    }

    /// Route a row tap to the matching picker and feed the answer back.
    pub async fn select_row(&self, kind: RowKind) {
        let (enabled, options, alarm_time) = {
            let core = self.core.lock().await;
            (
                core.state == SessionState::Idle,
                core.config.sleep_duration_options.clone(),
                core.alarm_time,
            )
        };

        if !enabled {
            debug!("ignoring {kind:?} row selection while a session is active");
            return;
        }

        match kind {
            RowKind::SleepTimer => {
                if let Some(choice) = self.ports.presenter.present_options(options).await {
                    self.did_select_sleep_timer_option(choice).await;
                }
            }
            RowKind::Alarm => {
                if let Some(choice) = self.ports.presenter.present_time_picker(Some(alarm_time)).await {
                    self.did_select_alarm_time(choice).await;
                }
            }
        }
    }

    /// Dismiss a sounding alarm without waiting for the prompt.
    pub async fn acknowledge_alarm(&self) {
        self.core.lock().await.acknowledge(None);
    }

    pub async fn sleep_duration(&self) -> SleepDuration {
        self.core.lock().await.sleep_duration
    }

    pub async fn alarm_time(&self) -> AlarmTime {
        self.core.lock().await.alarm_time
    }

    pub async fn remaining(&self, kind: TimerKind) -> Option<Duration> {
        self.core.lock().await.timers.remaining(kind)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot_rx.borrow().state
    }

    pub fn display_state(&self) -> DisplayState {
        self.snapshot_rx.borrow().display_state
    }

    pub fn is_running(&self) -> bool {
        self.snapshot_rx.borrow().is_running
    }

    pub fn rows(&self) -> Vec<Row> {
        self.snapshot_rx.borrow().rows.clone()
    }

    /// Latest snapshot; a late subscriber only ever sees the current value.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Change notifications. The session screen is expected to hold one
    /// active subscription per attached view.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Stop whatever is in progress and detach from the notification and
    /// interruption streams. Returns once every journal entry, including the
    /// one closing an interrupted night, has been written. The controller
    /// stays usable for rendering but journals nothing afterwards.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        {
            let mut core = self.core.lock().await;
            core.teardown();
            core.journal_tx = None;
        }

        let writer = self
            .journal_writer
            .lock()
            .ok()
            .and_then(|mut writer| writer.take());
        if let Some(writer) = writer {
            if let Err(err) = writer.await {
                error!("Journal writer failed: {err}");
            }
        }
    }

    #[cfg(test)]
    pub(super) async fn lock_core(&self) -> tokio::sync::MutexGuard<'_, SessionCore> {
        self.core.lock().await
    }
}

pub(super) struct SessionCore {
    state: SessionState,
    sleep_duration: SleepDuration,
    alarm_time: AlarmTime,
    permissions: Permissions,
    running: bool,
    resume_after_interruption: bool,
    timers: TimerSet,
    pending_notification: Option<NotificationId>,
    session_id: Option<String>,
    alarm_epoch: u64,
    alarm_prompt: Option<JoinHandle<()>>,
    config: SessionConfig,
    ports: SessionPorts,
    journal_tx: Option<mpsc::UnboundedSender<JournalEntry>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    self_ref: WeakCore,
}

impl SessionCore {
    fn permissions_granted(&self) -> bool {
        self.permissions.granted(self.config.optimistic_permissions)
    }

    fn apply_permissions(&mut self, microphone: bool, notifications: bool) {
        self.permissions = Permissions {
            microphone: Some(microphone),
            notifications: Some(notifications),
        };
        if self.permissions_granted() {
            info!("Microphone and notification permissions granted");
        } else {
            warn!(
                "Permissions denied (microphone: {microphone}, notifications: {notifications}); play is disabled"
            );
        }
    }

    async fn play(&mut self) {
        if !self.permissions_granted() {
            debug!("play ignored: permissions not granted");
            return;
        }
        if self.running {
            debug!("play ignored: already running");
            return;
        }

        self.resume_after_interruption = false;
        match self.state {
            SessionState::Idle => self.start_session().await,
            SessionState::Playing | SessionState::Recording => self.resume().await,
            SessionState::Alarm => debug!("play ignored: alarm is sounding"),
        }
    }

    fn pause(&mut self) {
        if !self.running {
            debug!("pause ignored: not running");
            return;
        }
        self.resume_after_interruption = false;
        self.suspend();
    }

    async fn start_session(&mut self) {
        let session_id = Uuid::new_v4().to_string();
        info!(
            "Starting sleep session {session_id} (sleep timer {}, alarm {})",
            self.sleep_duration, self.alarm_time
        );
        self.journal(JournalEntry::Started(SleepSessionRecord::started(
            session_id.clone(),
            Utc::now(),
            self.alarm_time,
            self.sleep_duration,
        )));
        self.session_id = Some(session_id);

        self.schedule_wake_notification().await;
        self.arm_alarm_timer();

        self.state = SessionState::Playing;
        self.running = true;

        if self.sleep_duration.is_off() {
            self.enter_recording().await;
            return;
        }

        self.ports.sleep_player.play();
        self.arm_sleep_stop_timer();
        self.publish();
    }

    async fn schedule_wake_notification(&mut self) {
        if let Some(stale) = self.pending_notification.take() {
            self.ports.notifications.cancel_notification(&stale);
        }

        let scheduled = self
            .ports
            .notifications
            .schedule_notification(&self.config.alarm_title, self.alarm_time)
            .await;
        match scheduled {
            Ok(id) => {
                debug!("wake notification {id:?} scheduled for {}", self.alarm_time);
                self.pending_notification = Some(id);
            }
            Err(err) => self.diagnostic(
                DiagnosticSource::Notifications,
                format!("failed to schedule wake notification: {err:#}"),
            ),
        }
    }

    fn arm_alarm_timer(&mut self) {
        let delay = self.alarm_time.delay_from(self.ports.clock.now());
        let core = self.self_ref.clone();
        self.timers.arm(TimerKind::AlarmTrigger, delay, move |id| {
            fire_timer(core, TimerKind::AlarmTrigger, id)
        });
        info!("Alarm {} armed, rings in {}s", self.alarm_time, delay.as_secs());
    }

    fn arm_sleep_stop_timer(&mut self) {
        let delay = self.sleep_duration.as_duration();
        let core = self.self_ref.clone();
        self.timers.arm(TimerKind::SleepStop, delay, move |id| {
            fire_timer(core, TimerKind::SleepStop, id)
        });
    }

    async fn on_timer_fired(&mut self, kind: TimerKind, id: TimerId) {
        if !self.timers.take_if_live(kind, id) {
            debug!("dropping stale {kind:?} timer {id:?}");
            return;
        }

        match (kind, self.state) {
            (TimerKind::SleepStop, SessionState::Playing) => self.enter_recording().await,
            (TimerKind::AlarmTrigger, SessionState::Playing | SessionState::Recording) => {
                self.enter_alarm(AlarmSource::Timer)
            }
            (kind, state) => debug!("{kind:?} timer fired in {state:?}; nothing to do"),
        }
    }

    fn on_notification_action(&mut self, action: NotificationAction) {
        if let Some(pending) = &self.pending_notification {
            if *pending != action.id {
                debug!("ignoring action for unknown notification {:?}", action.id);
                return;
            }
        }

        match self.state {
            SessionState::Playing | SessionState::Recording => {
                self.enter_alarm(AlarmSource::Notification)
            }
            state => debug!("wake notification action in {state:?}; nothing to do"),
        }
    }

    async fn on_interruption(&mut self, event: InterruptionEvent) {
        match event {
            InterruptionEvent::Began => {
                if self.running && self.suspend() {
                    info!("Audio interrupted; session suspended");
                    self.resume_after_interruption = true;
                }
            }
            InterruptionEvent::Ended { should_resume } => {
                let requested = std::mem::take(&mut self.resume_after_interruption);
                if requested && should_resume && !self.running {
                    info!("Interruption ended; resuming {:?}", self.state);
                    self.resume().await;
                } else {
                    debug!(
                        "interruption ended (should_resume: {should_resume}, requested: {requested}); staying put"
                    );
                }
            }
        }
    }

    async fn enter_recording(&mut self) {
        self.timers.cancel(TimerKind::SleepStop);
        self.ports.sleep_player.stop();
        self.state = SessionState::Recording;

        if let Err(err) = self.ports.recorder.prepare().await {
            self.diagnostic(
                DiagnosticSource::Recorder,
                format!("failed to prepare recorder: {err:#}"),
            );
        }

        if self.running {
            if let Err(err) = self.ports.recorder.record().await {
                self.diagnostic(
                    DiagnosticSource::Recorder,
                    format!("failed to start recording: {err:#}"),
                );
            }
        } else {
            info!("Sleep timer elapsed while paused; recording starts on resume");
        }

        self.publish();
    }

    fn enter_alarm(&mut self, source: AlarmSource) {
        info!("Alarm triggered by {source:?}");
        self.timers.cancel_all();
        match self.state {
            SessionState::Playing => self.ports.sleep_player.stop(),
            SessionState::Recording => self.ports.recorder.stop(),
            SessionState::Idle | SessionState::Alarm => {}
        }
        if let Some(id) = self.pending_notification.take() {
            self.ports.notifications.cancel_notification(&id);
        }

        self.state = SessionState::Alarm;
        self.running = true;
        self.resume_after_interruption = false;
        self.ports.alarm_player.play();

        if let Some(session_id) = self.session_id.clone() {
            self.journal(JournalEntry::Alarm {
                session_id,
                source,
                at: Utc::now(),
            });
        }

        self.spawn_alarm_prompt();
        self.publish();
    }

    fn spawn_alarm_prompt(&mut self) {
        self.alarm_epoch = self.alarm_epoch.wrapping_add(1);
        let epoch = self.alarm_epoch;
        let presenter = Arc::clone(&self.ports.presenter);
        let message = self.config.alarm_message.clone();
        let core = self.self_ref.clone();

        let prompt = tokio::spawn(async move {
            presenter.present_alarm_prompt(&message).await;
            if let Some(core) = core.upgrade() {
                core.lock().await.acknowledge(Some(epoch));
            }
        });

        if let Some(previous) = self.alarm_prompt.replace(prompt) {
            previous.abort();
        }
    }

    /// `epoch` is set when the acknowledgement comes from the prompt spawned
    /// for that alarm; a prompt from an earlier alarm is ignored.
    fn acknowledge(&mut self, epoch: Option<u64>) {
        if self.state != SessionState::Alarm {
            debug!("acknowledge ignored in {:?}", self.state);
            return;
        }
        if matches!(epoch, Some(epoch) if epoch != self.alarm_epoch) {
            debug!("ignoring acknowledgement from an earlier alarm prompt");
            return;
        }

        if let Some(prompt) = self.alarm_prompt.take() {
            // The prompt task is the caller when `epoch` is set.
            if epoch.is_none() {
                prompt.abort();
            }
        }

        self.ports.alarm_player.stop();
        self.timers.cancel_all();
        self.state = SessionState::Idle;
        self.running = false;
        self.finish_session(JournalStatus::Completed);
        info!("Alarm acknowledged; session complete");
        self.publish();
    }

    fn suspend(&mut self) -> bool {
        match self.state {
            SessionState::Playing => self.ports.sleep_player.pause(),
            SessionState::Recording => self.ports.recorder.pause(),
            SessionState::Idle | SessionState::Alarm => return false,
        }
        self.running = false;
        self.publish();
        true
    }

    /// Restart the current state's audio operation. Timers are left alone.
    async fn resume(&mut self) {
        match self.state {
            SessionState::Playing => self.ports.sleep_player.play(),
            SessionState::Recording => {
                if let Err(err) = self.ports.recorder.record().await {
                    self.diagnostic(
                        DiagnosticSource::Recorder,
                        format!("failed to resume recording: {err:#}"),
                    );
                }
            }
            SessionState::Idle | SessionState::Alarm => return,
        }
        self.running = true;
        self.publish();
    }

    fn select_sleep_duration(&mut self, sleep_duration: SleepDuration) {
        info!("Sleep timer set to {sleep_duration}");
        self.sleep_duration = sleep_duration;
        self.publish();
    }

    fn select_alarm_time(&mut self, alarm_time: AlarmTime) {
        info!("Alarm time set to {alarm_time}");
        self.alarm_time = alarm_time;
        self.publish();
    }

    fn teardown(&mut self) {
        self.timers.cancel_all();
        if let Some(prompt) = self.alarm_prompt.take() {
            prompt.abort();
        }
        if let Some(id) = self.pending_notification.take() {
            self.ports.notifications.cancel_notification(&id);
        }

        match self.state {
            SessionState::Idle => {}
            SessionState::Playing => self.ports.sleep_player.stop(),
            SessionState::Recording => self.ports.recorder.stop(),
            SessionState::Alarm => self.ports.alarm_player.stop(),
        }
        if self.state != SessionState::Idle {
            warn!("Session torn down while {:?}", self.state);
            self.finish_session(JournalStatus::Interrupted);
        }

        self.state = SessionState::Idle;
        self.running = false;
        self.resume_after_interruption = false;
        self.publish();
    }

    fn finish_session(&mut self, status: JournalStatus) {
        if let Some(session_id) = self.session_id.take() {
            self.journal(JournalEntry::Finished {
                session_id,
                status,
                at: Utc::now(),
            });
        }
    }

    fn journal(&self, entry: JournalEntry) {
        if let Some(tx) = &self.journal_tx {
            if tx.send(entry).is_err() {
                error!("Journal writer stopped; dropping entry");
            }
        }
    }

    fn diagnostic(&self, source: DiagnosticSource, message: String) {
        warn!("{message}");
        let _ = self.events_tx.send(SessionEvent::Diagnostic { source, message });
    }

    fn publish(&mut self) {
        let next = snapshot_of(
            self.state,
            self.running,
            &self.sleep_duration,
            &self.alarm_time,
        );
        let previous = self.snapshot_tx.send_replace(next.clone());

        if previous.state != next.state {
            info!("Session {:?} -> {:?}", previous.state, next.state);
            let _ = self.events_tx.send(SessionEvent::StateChanged {
                state: next.state,
                display_state: next.display_state,
            });
        }
        if previous.is_running != next.is_running {
            let _ = self.events_tx.send(SessionEvent::RunningChanged {
                is_running: next.is_running,
            });
        }
        if previous.rows != next.rows {
            let _ = self.events_tx.send(SessionEvent::RowsChanged { rows: next.rows });
        }
    }
}

fn snapshot_of(
    state: SessionState,
    running: bool,
    sleep_duration: &SleepDuration,
    alarm_time: &AlarmTime,
) -> SessionSnapshot {
    SessionSnapshot {
        state,
        display_state: state.display_state(),
        is_running: running,
        rows: build_rows(sleep_duration, alarm_time, state == SessionState::Idle),
    }
}

async fn fire_timer(core: WeakCore, kind: TimerKind, id: TimerId) {
    let Some(core) = core.upgrade() else {
        return;
    };
    core.lock().await.on_timer_fired(kind, id).await;
}

fn spawn_action_pump(
    core: WeakCore,
    mut actions: broadcast::Receiver<NotificationAction>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = actions.recv() => match received {
                    Ok(action) => {
                        let Some(core) = core.upgrade() else { break };
                        core.lock().await.on_notification_action(action);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("notification action stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("notification action pump stopped");
    })
}

fn spawn_interruption_pump(
    core: WeakCore,
    mut interruptions: broadcast::Receiver<InterruptionEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = interruptions.recv() => match received {
                    Ok(event) => {
                        let Some(core) = core.upgrade() else { break };
                        core.lock().await.on_interruption(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("interruption stream lagged by {skipped}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("interruption pump stopped");
    })
}

/// Writes journal entries in order on one task; failures become diagnostics.
/// The task ends once every sender is gone and the queue is drained.
fn spawn_journal_writer(
    journal: Journal,
    events_tx: broadcast::Sender<SessionEvent>,
) -> (mpsc::UnboundedSender<JournalEntry>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();

    let writer = tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let result = match entry {
                JournalEntry::Started(record) => journal.record_started(&record).await,
                JournalEntry::Alarm {
                    session_id,
                    source,
                    at,
                } => journal.record_alarm(&session_id, source, at).await,
                JournalEntry::Finished {
                    session_id,
                    status,
                    at,
                } => journal.record_finished(&session_id, status, at).await,
            };

            if let Err(err) = result {
                let message = format!("journal write failed: {err:#}");
                error!("{message}");
                let _ = events_tx.send(SessionEvent::Diagnostic {
                    source: DiagnosticSource::Journal,
                    message,
                });
            }
        }
        debug!("journal writer drained");
    });

    (tx, writer)
}
