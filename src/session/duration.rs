use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Longest timer a duration resolves to.
pub const MAX_TIMER: Duration = Duration::from_secs(u32::MAX as u64);

/// How long the sleep sound plays before the session switches to recording.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum SleepDuration {
    Off,
    Minutes(u32),
    Seconds(f64),
}

impl Default for SleepDuration {
    fn default() -> Self {
        SleepDuration::Minutes(20)
    }
}

impl SleepDuration {
    /// Options offered by the sleep timer picker.
    pub fn standard_options() -> Vec<SleepDuration> {
        vec![
            SleepDuration::Off,
            SleepDuration::Minutes(1),
            SleepDuration::Minutes(5),
            SleepDuration::Minutes(10),
            SleepDuration::Minutes(15),
            SleepDuration::Minutes(20),
        ]
    }

    /// Elapsed seconds this duration stands for.
    pub fn resolve(&self) -> f64 {
        match *self {
            SleepDuration::Off => 0.0,
            SleepDuration::Minutes(minutes) => f64::from(minutes) * 60.0,
            SleepDuration::Seconds(seconds) => seconds,
        }
    }

    pub fn is_off(&self) -> bool {
        matches!(self, SleepDuration::Off)
    }

    /// Negative or NaN second counts clamp to zero, anything past
    /// [`MAX_TIMER`] clamps to it.
    pub fn as_duration(&self) -> Duration {
        let seconds = self.resolve();
        if seconds.is_nan() || seconds <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(seconds)
            .unwrap_or(MAX_TIMER)
            .min(MAX_TIMER)
    }

    pub fn display_label(&self) -> String {
        match *self {
            SleepDuration::Off => "off".to_string(),
            SleepDuration::Minutes(minutes) => format!("{minutes} min"),
            SleepDuration::Seconds(seconds) => format!("{seconds} sec"),
        }
    }
}

impl fmt::Display for SleepDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolves_to_elapsed_seconds() {
        assert_eq!(SleepDuration::Off.resolve(), 0.0);
        assert_eq!(SleepDuration::Minutes(20).resolve(), 1200.0);
        assert_eq!(SleepDuration::Seconds(10.0).resolve(), 10.0);
        assert_eq!(SleepDuration::Seconds(0.5).as_duration(), Duration::from_millis(500));
    }

    #[test]
    fn labels_match_picker_text() {
        assert_eq!(SleepDuration::Off.display_label(), "off");
        assert_eq!(SleepDuration::Minutes(20).display_label(), "20 min");
        assert_eq!(SleepDuration::Seconds(10.0).display_label(), "10 sec");
    }

    #[test]
    fn bogus_seconds_clamp_to_zero() {
        assert_eq!(SleepDuration::Seconds(-3.0).as_duration(), Duration::ZERO);
        assert_eq!(SleepDuration::Seconds(f64::NAN).as_duration(), Duration::ZERO);
    }

    #[test]
    fn huge_seconds_clamp_to_longest_timer() {
        assert_eq!(SleepDuration::Seconds(1e20).as_duration(), MAX_TIMER);
        assert_eq!(SleepDuration::Seconds(f64::INFINITY).as_duration(), MAX_TIMER);
        assert_eq!(SleepDuration::Seconds(f64::MAX).as_duration(), MAX_TIMER);
        assert_eq!(SleepDuration::Minutes(u32::MAX).as_duration(), MAX_TIMER);
    }

    #[test]
    fn default_is_twenty_minutes_and_listed() {
        let default = SleepDuration::default();
        assert_eq!(default, SleepDuration::Minutes(20));
        assert!(SleepDuration::standard_options().contains(&default));
    }
}
