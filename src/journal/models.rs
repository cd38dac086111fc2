use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{AlarmTime, SleepDuration};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum JournalStatus {
    Running,
    AlarmFired,
    Completed,
    Interrupted,
}

impl JournalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalStatus::Running => "Running",
            JournalStatus::AlarmFired => "AlarmFired",
            JournalStatus::Completed => "Completed",
            JournalStatus::Interrupted => "Interrupted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Running" => Ok(JournalStatus::Running),
            "AlarmFired" => Ok(JournalStatus::AlarmFired),
            "Completed" => Ok(JournalStatus::Completed),
            "Interrupted" => Ok(JournalStatus::Interrupted),
            _ => Err(anyhow!("unknown session status '{value}'")),
        }
    }
}

/// What woke the sleeper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AlarmSource {
    Timer,
    Notification,
}

impl AlarmSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmSource::Timer => "Timer",
            AlarmSource::Notification => "Notification",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "Timer" => Ok(AlarmSource::Timer),
            "Notification" => Ok(AlarmSource::Notification),
            _ => Err(anyhow!("unknown alarm source '{value}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SleepSessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub alarm_time: AlarmTime,
    pub sleep_duration: SleepDuration,
    pub status: JournalStatus,
    pub alarm_fired_at: Option<DateTime<Utc>>,
    pub alarm_source: Option<AlarmSource>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SleepSessionRecord {
    pub fn started(
        id: String,
        started_at: DateTime<Utc>,
        alarm_time: AlarmTime,
        sleep_duration: SleepDuration,
    ) -> Self {
        Self {
            id,
            started_at,
            alarm_time,
            sleep_duration,
            status: JournalStatus::Running,
            alarm_fired_at: None,
            alarm_source: None,
            stopped_at: None,
            updated_at: started_at,
        }
    }
}
