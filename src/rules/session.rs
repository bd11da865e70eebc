// =============================================================================
// Trading-session time arithmetic
// =============================================================================
//
// Session windows are expressed as minutes since midnight Eastern time and
// resolve deterministically:
//
//   ny      [09:30, 16:00)
//   london  [03:00, 12:00)
//   asia    [20:00, 04:00)   -- spans midnight: [20:00, 24:00) U [00:00, 04:00)
//   all     [00:00, 24:00)
//   custom  parsed HH:MM endpoints
// =============================================================================

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

use crate::errors::ValidationError;
use crate::rules::schema::{parse_hhmm, Session, TimeRules};

/// Minutes since midnight at the NY session open.
pub const NY_OPEN_MINUTE: u32 = 9 * 60 + 30;
/// Minutes since midnight at the NY session close.
pub const NY_CLOSE_MINUTE: u32 = 16 * 60;

/// A half-open window of minutes-of-day. `start > end` means the window wraps
/// past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    pub start: u32,
    pub end: u32,
}

impl SessionWindow {
    /// Wrap-aware membership test for a minute-of-day.
    pub fn contains(&self, minute: u32) -> bool {
        if self.start <= self.end {
            minute >= self.start && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }

    /// Minutes elapsed since the window opened, wrap-aware.
    pub fn minutes_since_open(&self, minute: u32) -> u32 {
        (minute + 1440 - self.start) % 1440
    }
}

/// Resolve the session window for a set of time rules.
pub fn session_window(time: &TimeRules) -> Result<SessionWindow, ValidationError> {
    let window = match time.session {
        Session::Ny => SessionWindow {
            start: NY_OPEN_MINUTE,
            end: NY_CLOSE_MINUTE,
        },
        Session::London => SessionWindow {
            start: 3 * 60,
            end: 12 * 60,
        },
        Session::Asia => SessionWindow {
            start: 20 * 60,
            end: 4 * 60,
        },
        Session::All => SessionWindow { start: 0, end: 1440 },
        Session::Custom => {
            let start = time
                .custom_start
                .as_deref()
                .ok_or_else(|| ValidationError("custom session missing customStart".into()))?;
            let end = time
                .custom_end
                .as_deref()
                .ok_or_else(|| ValidationError("custom session missing customEnd".into()))?;
            SessionWindow {
                start: parse_hhmm(start)?,
                end: parse_hhmm(end)?,
            }
        }
    };
    Ok(window)
}

/// The timezone the rules evaluate in; falls back to Eastern when the stored
/// name is unknown.
pub fn rules_timezone(time: &TimeRules) -> Tz {
    time.timezone.parse().unwrap_or(New_York)
}

/// Minute-of-day for `now` in the rules' timezone.
pub fn minute_of_day(now: DateTime<Utc>, time: &TimeRules) -> u32 {
    let local = now.with_timezone(&rules_timezone(time));
    local.hour() * 60 + local.minute()
}

/// Minute-of-day for `now` in Eastern time.
pub fn minute_of_day_eastern(now: DateTime<Utc>) -> u32 {
    let local = now.with_timezone(&New_York);
    local.hour() * 60 + local.minute()
}

/// The next 16:00 Eastern market close at or after `now`. Intraday strategy
/// state expires here by default.
pub fn next_market_close(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&New_York);
    let close_today = New_York
        .with_ymd_and_hms(local.year(), local.month(), local.day(), 16, 0, 0)
        .single()
        // 16:00 exists on every Eastern calendar day (DST shifts at 02:00).
        .unwrap_or_else(|| local + Duration::hours(24));

    let close = if local < close_today {
        close_today
    } else {
        close_today + Duration::days(1)
    };
    close.with_timezone(&Utc)
}

/// Today's date (Eastern) at the given minute-of-day, as a UTC instant.
/// Used to anchor opening-range windows to the current session.
pub fn eastern_today_at(now: DateTime<Utc>, minute: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&New_York);
    New_York
        .with_ymd_and_hms(local.year(), local.month(), local.day(), minute / 60, minute % 60, 0)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}
