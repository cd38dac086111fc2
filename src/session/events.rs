use serde::Serialize;

use super::{rows::Row, DisplayState, SessionState};

/// Everything a view needs to render the session screen.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub display_state: DisplayState,
    pub is_running: bool,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DiagnosticSource {
    Recorder,
    Notifications,
    Journal,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
        display_state: DisplayState,
    },
    RunningChanged {
        is_running: bool,
    },
    RowsChanged {
        rows: Vec<Row>,
    },
    /// A collaborator failed. The session carries on regardless.
    Diagnostic {
        source: DiagnosticSource,
        message: String,
    },
}
