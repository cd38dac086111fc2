pub mod controller;
pub mod duration;
pub mod events;
pub mod rows;
pub mod state;
pub mod timers;


pub use controller::{SessionConfig, SessionController, SessionPorts};
pub use duration::SleepDuration;
pub use events::{DiagnosticSource, SessionEvent, SessionSnapshot};
pub use rows::{Row, RowKind};
pub use state::{AlarmTime, DisplayState, SessionState};
pub use timers::{TimerKind, TimerSet};
