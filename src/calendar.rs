// =============================================================================
// Trading calendar & clock — A-share session rules
// =============================================================================
//
// The mainland session runs 09:30–11:30 and 13:00–15:00 local time,
// Monday to Friday. Saturday is the force-refresh day for the weekly full
// bar rebuild. Holidays beyond the weekend are not modelled; upstream
// providers simply return no rows on them and the pipeline tolerates
// empty days silently.
//
// All checks take an explicit timestamp so that tests can pin the clock.
// =============================================================================

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveTime, Timelike, Weekday};

/// Morning session open, inclusive.
const MORNING_OPEN: (u32, u32) = (9, 30);
/// Morning session close, inclusive.
const MORNING_CLOSE: (u32, u32) = (11, 30);
/// Afternoon session open, inclusive.
const AFTERNOON_OPEN: (u32, u32) = (13, 0);
/// Afternoon session close, inclusive.
const AFTERNOON_CLOSE: (u32, u32) = (15, 0);

/// Whether `t` falls on a trading day (weekday, no holiday table).
pub fn is_trading_day(t: DateTime<Local>) -> bool {
    !matches!(t.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Whether `t` falls inside a trading session (09:30–11:30, 13:00–15:00).
pub fn is_trading_time(t: DateTime<Local>) -> bool {
    if !is_trading_day(t) {
        return false;
    }
    let minutes = t.hour() * 60 + t.minute();
    let in_window = |open: (u32, u32), close: (u32, u32)| {
        let lo = open.0 * 60 + open.1;
        let hi = close.0 * 60 + close.1;
        minutes >= lo && minutes <= hi
    };
    in_window(MORNING_OPEN, MORNING_CLOSE) || in_window(AFTERNOON_OPEN, AFTERNOON_CLOSE)
}

/// Whether `t` is a force-update day: Saturday, on which the full bar
/// refresh is unconditionally eligible.
pub fn is_force_update_day(t: DateTime<Local>) -> bool {
    t.weekday() == Weekday::Sat
}

/// Whether `t` is a weekday after the 15:00 close (the smart-update and
/// full-refresh window).
pub fn is_after_close(t: DateTime<Local>) -> bool {
    is_trading_day(t) && t.time() > NaiveTime::from_hms_opt(15, 0, 0).expect("valid time")
}

/// Normalise a date string to canonical `YYYY-MM-DD`.
///
/// Accepts `YYYYMMDD`, `YYYY-MM-DD`, and ISO timestamps (the date part is
/// kept). Returns `None` for anything else.
pub fn normalise_date(s: &str) -> Option<String> {
    let s = s.trim();

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(s, "%Y%m%d").ok()?;
        return Some(date.format("%Y-%m-%d").to_string());
    }

    if s.len() == 10 {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
        return Some(date.format("%Y-%m-%d").to_string());
    }

    // ISO timestamps: `2024-12-20T15:00:00`, with optional zone suffix.
    if s.len() > 10 {
        let date = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d").ok()?;
        return Some(date.format("%Y-%m-%d").to_string());
    }

    None
}

/// Compact `YYYYMMDD` form for provider requests.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("unambiguous local time")
    }

    // 2025-06-02 is a Monday, 2025-06-07 a Saturday.

    #[test]
    fn weekday_is_trading_day() {
        assert!(is_trading_day(local(2025, 6, 2, 10, 0)));
        assert!(!is_trading_day(local(2025, 6, 7, 10, 0)));
        assert!(!is_trading_day(local(2025, 6, 8, 10, 0)));
    }

    #[test]
    fn session_windows() {
        assert!(!is_trading_time(local(2025, 6, 2, 9, 29)));
        assert!(is_trading_time(local(2025, 6, 2, 9, 30)));
        assert!(is_trading_time(local(2025, 6, 2, 11, 30)));
        assert!(!is_trading_time(local(2025, 6, 2, 11, 31)));
        assert!(!is_trading_time(local(2025, 6, 2, 12, 30)));
        assert!(is_trading_time(local(2025, 6, 2, 13, 0)));
        assert!(is_trading_time(local(2025, 6, 2, 15, 0)));
        assert!(!is_trading_time(local(2025, 6, 2, 15, 1)));
    }

    #[test]
    fn weekend_never_trading_time() {
        assert!(!is_trading_time(local(2025, 6, 7, 10, 0)));
    }

    #[test]
    fn saturday_is_force_update_day() {
        assert!(is_force_update_day(local(2025, 6, 7, 3, 0)));
        assert!(!is_force_update_day(local(2025, 6, 2, 3, 0)));
    }

    #[test]
    fn after_close_window() {
        assert!(is_after_close(local(2025, 6, 2, 17, 30)));
        assert!(!is_after_close(local(2025, 6, 2, 14, 59)));
        assert!(!is_after_close(local(2025, 6, 7, 17, 30)));
    }

    #[test]
    fn normalise_compact_form() {
        assert_eq!(normalise_date("20241220").as_deref(), Some("2024-12-20"));
    }

    #[test]
    fn normalise_dashed_form() {
        assert_eq!(normalise_date("2024-12-20").as_deref(), Some("2024-12-20"));
    }

    #[test]
    fn normalise_iso_timestamp() {
        assert_eq!(
            normalise_date("2024-12-20T15:00:00").as_deref(),
            Some("2024-12-20")
        );
        assert_eq!(
            normalise_date("2024-12-20 15:00:00").as_deref(),
            Some("2024-12-20")
        );
    }

    #[test]
    fn normalise_rejects_garbage() {
        assert_eq!(normalise_date("not-a-date"), None);
        assert_eq!(normalise_date("2024/12/20"), None);
        assert_eq!(normalise_date("202412"), None);
    }
}
