use serde::Serialize;

use super::{AlarmTime, SleepDuration};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RowKind {
    SleepTimer,
    Alarm,
}

/// One key/value line of the session screen.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub kind: RowKind,
    pub title: String,
    pub detail: String,
    pub enabled: bool,
}

/// Rows are only selectable while no session is in progress.
pub fn build_rows(sleep_duration: &SleepDuration, alarm_time: &AlarmTime, enabled: bool) -> Vec<Row> {
    vec![
        Row {
            kind: RowKind::SleepTimer,
            title: "Sleep Timer".into(),
            detail: sleep_duration.display_label(),
            enabled,
        },
        Row {
            kind: RowKind::Alarm,
            title: "Alarm".into(),
            detail: alarm_time.to_string(),
            enabled,
        },
    ]
}
