use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Playing,
    Recording,
    Alarm,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl SessionState {
    pub fn display_state(&self) -> DisplayState {
        match self {
            SessionState::Idle => DisplayState::Idle,
            SessionState::Playing => DisplayState::FallingAsleep,
            SessionState::Recording => DisplayState::Sleeping,
            SessionState::Alarm => DisplayState::Alarm,
        }
    }
}

/// Coarse projection of [`SessionState`] shown to the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisplayState {
    Idle,
    FallingAsleep,
    Sleeping,
    Alarm,
}

impl DisplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayState::Idle => "idle",
            DisplayState::FallingAsleep => "fallingAsleep",
            DisplayState::Sleeping => "sleeping",
            DisplayState::Alarm => "alarm",
        }
    }
}

/// Wall-clock time of day the alarm goes off. Only hour and minute are tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct AlarmTime {
    hour: u8,
    minute: u8,
}

impl Default for AlarmTime {
    fn default() -> Self {
        Self { hour: 8, minute: 30 }
    }
}

impl AlarmTime {
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour >= 24 {
            bail!("alarm hour {hour} is out of range (0-23)");
        }
        if minute >= 60 {
            bail!("alarm minute {minute} is out of range (0-59)");
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn as_naive_time(&self) -> NaiveTime {
        // Fields are validated on construction, so this never falls back.
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0)
            .unwrap_or(NaiveTime::MIN)
    }

    /// Next instant at which this alarm should ring, strictly after `now`.
    ///
    /// Compares the full hour/minute pair: at 07:45 an alarm of 07:30 rings
    /// tomorrow, an alarm of 07:50 rings in five minutes.
    pub fn next_occurrence(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.as_naive_time());
        if today > now {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }

    /// Delay from `now` until [`next_occurrence`](Self::next_occurrence).
    pub fn delay_from(&self, now: NaiveDateTime) -> Duration {
        (self.next_occurrence(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for AlarmTime {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (hour, minute) = value
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("alarm time '{value}' must look like HH:MM"))?;
        let hour = hour
            .parse::<u8>()
            .with_context(|| format!("invalid alarm hour in '{value}'"))?;
        let minute = minute
            .parse::<u8>()
            .with_context(|| format!("invalid alarm minute in '{value}'"))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for AlarmTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AlarmTime> for String {
    fn from(value: AlarmTime) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .expect("valid test timestamp")
    }

    #[test]
    fn later_today_stays_on_same_day() {
        let alarm = AlarmTime::new(8, 30).unwrap();
        assert_eq!(alarm.next_occurrence(at(23, 10)), at(8, 30) + ChronoDuration::days(1));
        assert_eq!(alarm.next_occurrence(at(6, 0)), at(8, 30));
    }

    #[test]
    fn same_hour_compares_minutes_too() {
        let alarm = AlarmTime::new(7, 30).unwrap();
        let now = at(7, 45);
        assert_eq!(alarm.next_occurrence(now), at(7, 30) + ChronoDuration::days(1));

        let soon = AlarmTime::new(7, 50).unwrap();
        assert_eq!(soon.delay_from(now), Duration::from_secs(5 * 60));
    }

    #[test]
    fn alarm_equal_to_now_rolls_over() {
        let alarm = AlarmTime::new(8, 30).unwrap();
        assert_eq!(alarm.delay_from(at(8, 30)), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn parses_and_formats_hh_mm() {
        let alarm: AlarmTime = "6:05".parse().unwrap();
        assert_eq!(alarm, AlarmTime::new(6, 5).unwrap());
        assert_eq!(alarm.to_string(), "06:05");
        assert!("24:00".parse::<AlarmTime>().is_err());
        assert!("07:60".parse::<AlarmTime>().is_err());
        assert!("0730".parse::<AlarmTime>().is_err());
    }

    #[test]
    fn display_state_projection() {
        assert_eq!(SessionState::Playing.display_state(), DisplayState::FallingAsleep);
        assert_eq!(SessionState::Recording.display_state(), DisplayState::Sleeping);
        assert_eq!(SessionState::Idle.display_state().as_str(), "idle");
    }
}
