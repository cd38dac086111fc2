//! Narrow interfaces to everything the session controller does not own.
//!
//! Audio, capture, notifications, presentation and interruption signals are
//! all injected as trait objects so the controller can be driven by the
//! desktop adapters in this crate or by test doubles.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::{AlarmTime, SleepDuration};

/// Plays, pauses and stops a single sound asset.
pub trait AudioPlayer: Send + Sync {
    fn is_playing(&self) -> bool;
    fn play(&self);
    fn pause(&self);
    fn stop(&self);
}

/// Captures ambient audio to a file owned by the recorder.
#[async_trait]
pub trait AudioRecorder: Send + Sync {
    fn is_recording(&self) -> bool;
    /// Open a fresh capture target. Calling it again closes the previous one.
    async fn prepare(&self) -> Result<()>;
    /// Start or continue capture, preparing first if nothing is prepared.
    async fn record(&self) -> Result<()>;
    fn pause(&self);
    fn stop(&self);
    async fn request_permission(&self) -> bool;
}

/// Identifier handed back by the scheduler for a pending notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub String);

/// The user acted on a delivered wake notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub id: NotificationId,
}

#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    async fn request_permission(&self) -> bool;
    async fn schedule_notification(&self, title: &str, at: AlarmTime) -> Result<NotificationId>;
    fn cancel_notification(&self, id: &NotificationId);
    fn actions(&self) -> broadcast::Receiver<NotificationAction>;
}

#[async_trait]
pub trait Presenter: Send + Sync {
    async fn present_options(&self, options: Vec<SleepDuration>) -> Option<SleepDuration>;
    async fn present_time_picker(&self, initial: Option<AlarmTime>) -> Option<AlarmTime>;
    /// Resolves once the user acknowledges the alarm.
    async fn present_alarm_prompt(&self, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptionEvent {
    Began,
    Ended { should_resume: bool },
}

pub trait InterruptionSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<InterruptionEvent>;
}

/// Source of local wall-clock time for alarm scheduling.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}
