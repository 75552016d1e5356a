//! Time source and time-of-day helpers.
//!
//! Every component takes an `Arc<dyn Clock>` instead of calling `Utc::now()`
//! directly so timers, dwell periods, cooldowns and TTLs can be driven by a
//! `ManualClock` in tests. Daily windows and the reset time are evaluated in
//! the gateway's local time zone.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Timestamp = DateTime<Utc>;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = ts;
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Seconds from `earlier` to `later` as a float (negative if reversed).
pub fn secs_between(later: Timestamp, earlier: Timestamp) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

pub fn plus_secs(ts: Timestamp, secs: f64) -> Timestamp {
    ts + Duration::milliseconds((secs * 1000.0).round() as i64)
}

pub fn to_unix(ts: Timestamp) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

pub fn from_unix(secs: f64) -> Option<Timestamp> {
    if !secs.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

pub fn local(ts: Timestamp) -> NaiveDateTime {
    ts.with_timezone(&Local).naive_local()
}

/// Map a local wall-clock time back to UTC. Skipped wall-clock times (DST
/// gaps) fall back to interpreting the value as UTC.
pub fn from_local(naive: NaiveDateTime) -> Timestamp {
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

// ---------------------------------------------------------------------------
// Time of day ("HH:MM")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn hm(hour: u32, minute: u32) -> Self {
        Self(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN))
    }

    pub fn time(self) -> NaiveTime {
        self.0
    }

    fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.0)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour: u32 = h.trim().parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute: u32 = m.trim().parse().map_err(|_| format!("bad minute in {s:?}"))?;
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| format!("time of day out of range: {s:?}"))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Daily windows
// ---------------------------------------------------------------------------

/// A recurring local-time window. `end <= start` spans midnight; equal
/// endpoints cover the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyWindow {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl DailyWindow {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    /// The occurrence of this window relevant to `now`: the one containing it
    /// if any, otherwise today's.
    pub fn bounds(&self, now: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
        let today = now.date();
        if self.end > self.start {
            return (self.start.on(today), self.end.on(today));
        }
        let end_today = self.end.on(today);
        if now < end_today {
            (self.start.on(today - Duration::days(1)), end_today)
        } else {
            (self.start.on(today), self.end.on(today + Duration::days(1)))
        }
    }

    pub fn contains(&self, now: NaiveDateTime) -> bool {
        let (start, end) = self.bounds(now);
        start <= now && now < end
    }

    pub fn contains_ts(&self, ts: Timestamp) -> bool {
        self.contains(local(ts))
    }

    /// End of the occurrence relevant to `ts`, in UTC.
    pub fn end_after(&self, ts: Timestamp) -> Timestamp {
        from_local(self.bounds(local(ts)).1)
    }
}

// ---------------------------------------------------------------------------
// Daily reset
// ---------------------------------------------------------------------------

/// The "automation day" `now` belongs to. It rolls over at `reset_time`
/// rather than at midnight.
pub fn reset_key(now: NaiveDateTime, reset_time: TimeOfDay) -> NaiveDate {
    if now.time() < reset_time.time() {
        now.date() - Duration::days(1)
    } else {
        now.date()
    }
}

/// The next instant at which `reset_key` changes.
pub fn next_reset(now: Timestamp, reset_time: TimeOfDay) -> Timestamp {
    let now_local = local(now);
    let key = reset_key(now_local, reset_time);
    from_local(reset_time.on(key + Duration::days(1)))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn hm(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    // -- TimeOfDay ----------------------------------------------------------

    #[test]
    fn parses_hh_mm() {
        assert_eq!(hm("06:00"), TimeOfDay::hm(6, 0));
        assert_eq!(hm(" 22:30 "), TimeOfDay::hm(22, 30));
        assert_eq!(hm("7:05").to_string(), "07:05");
    }

    #[test]
    fn rejects_malformed_time() {
        assert!("25:00".parse::<TimeOfDay>().is_err());
        assert!("12".parse::<TimeOfDay>().is_err());
        assert!("ab:cd".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn time_of_day_serde_as_string() {
        #[derive(Deserialize)]
        struct W {
            t: TimeOfDay,
        }
        let w: W = toml::from_str(r#"t = "05:45""#).unwrap();
        assert_eq!(w.t, TimeOfDay::hm(5, 45));
        assert!(toml::from_str::<W>(r#"t = "99:00""#).is_err());
    }

    // -- DailyWindow --------------------------------------------------------

    #[test]
    fn daytime_window() {
        let w = DailyWindow::new(hm("06:00"), hm("22:00"));
        assert!(!w.contains(at(2024, 5, 1, 5, 59)));
        assert!(w.contains(at(2024, 5, 1, 6, 0)));
        assert!(w.contains(at(2024, 5, 1, 21, 59)));
        assert!(!w.contains(at(2024, 5, 1, 22, 0)));
    }

    #[test]
    fn overnight_window_spans_midnight() {
        let w = DailyWindow::new(hm("22:00"), hm("06:00"));
        assert!(w.contains(at(2024, 5, 1, 23, 0)));
        assert!(w.contains(at(2024, 5, 2, 3, 0)));
        assert!(!w.contains(at(2024, 5, 2, 12, 0)));
        assert!(!w.contains(at(2024, 5, 2, 6, 0)));

        let (start, end) = w.bounds(at(2024, 5, 2, 3, 0));
        assert_eq!(start, at(2024, 5, 1, 22, 0));
        assert_eq!(end, at(2024, 5, 2, 6, 0));
    }

    #[test]
    fn equal_endpoints_cover_whole_day() {
        let w = DailyWindow::new(hm("00:00"), hm("00:00"));
        assert!(w.contains(at(2024, 5, 1, 0, 0)));
        assert!(w.contains(at(2024, 5, 1, 13, 0)));
        assert!(w.contains(at(2024, 5, 1, 23, 59)));
    }

    // -- Reset key ----------------------------------------------------------

    #[test]
    fn reset_key_rolls_at_reset_time() {
        let reset = hm("04:00");
        assert_eq!(
            reset_key(at(2024, 5, 2, 3, 59), reset),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert_eq!(
            reset_key(at(2024, 5, 2, 4, 0), reset),
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
        );
    }

    #[test]
    fn next_reset_is_in_the_future() {
        let now = from_local(at(2024, 5, 2, 10, 0));
        let next = next_reset(now, hm("00:00"));
        assert_eq!(local(next), at(2024, 5, 3, 0, 0));
    }

    // -- ManualClock --------------------------------------------------------

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance_secs(31);
        assert_eq!(secs_between(clock.now(), start), 31.0);
    }

    #[test]
    fn unix_conversion() {
        let ts = from_unix(1_700_000_000.5).unwrap();
        assert_eq!(to_unix(ts), 1_700_000_000.5);
        assert!(from_unix(f64::NAN).is_none());
    }
}
