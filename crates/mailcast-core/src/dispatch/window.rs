//! Recipient-local send windows

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use mailcast_common::{Error, Result};
use mailcast_storage::models::ScheduleSettings;

/// Parse an "HH:MM" wall-clock time
pub fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| Error::Validation(format!("invalid time of day: {:?} (expected HH:MM)", value)))
}

/// Zone for a recipient, falling back when missing or unknown
pub fn resolve_timezone(name: Option<&str>, fallback: Tz) -> Tz {
    name.and_then(|n| n.trim().parse::<Tz>().ok())
        .unwrap_or(fallback)
}

/// Daily `[start, end)` window; `end < start` wraps past midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl SendWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self::new(parse_hhmm(start)?, parse_hhmm(end)?))
    }

    /// Window configured on a schedule, if the timezone mode is on
    pub fn from_schedule(schedule: &ScheduleSettings) -> Result<Option<Self>> {
        if !schedule.use_recipient_timezone {
            return Ok(None);
        }
        match (&schedule.time_window_start, &schedule.time_window_end) {
            (Some(start), Some(end)) => Self::parse(start, end).map(Some),
            (None, None) => Ok(None),
            _ => Err(Error::Validation(
                "time_window_start and time_window_end must be set together".to_string(),
            )),
        }
    }

    /// Whether a local wall-clock time falls inside the window
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// Whether `now` is inside the window in `tz`
    pub fn is_open(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.contains(now.with_timezone(&tz).time())
    }

    /// Next instant at or after `now` when the window opens in `tz`
    pub fn next_opening(&self, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        let local = now.with_timezone(&tz);
        let mut date = local.date_naive();
        if local.time() >= self.start {
            date = date.succ_opt().unwrap_or(date);
        }

        let mut candidate = date.and_time(self.start);
        // Step over DST gaps where the opening time does not exist locally
        for _ in 0..4 {
            if let Some(at) = tz.from_local_datetime(&candidate).earliest() {
                return at.with_timezone(&Utc);
            }
            candidate += Duration::minutes(30);
        }
        now + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("09:30").unwrap(), hm(9, 30));
        assert!(parse_hhmm("9h30").is_err());
        assert!(parse_hhmm("25:00").is_err());
    }

    #[test]
    fn test_contains_simple_window() {
        let window = SendWindow::new(hm(9, 0), hm(17, 0));
        assert!(window.contains(hm(9, 0)));
        assert!(window.contains(hm(16, 59)));
        assert!(!window.contains(hm(17, 0)));
        assert!(!window.contains(hm(3, 0)));
    }

    #[test]
    fn test_contains_wrapping_window() {
        let window = SendWindow::new(hm(22, 0), hm(6, 0));
        assert!(window.contains(hm(23, 30)));
        assert!(window.contains(hm(5, 59)));
        assert!(!window.contains(hm(12, 0)));
    }

    #[test]
    fn test_next_opening_same_day_and_next_day() {
        let window = SendWindow::new(hm(9, 0), hm(17, 0));
        let tz: Tz = "Europe/Paris".parse().unwrap();

        // 05:00 UTC in January is 06:00 in Paris, opening is 09:00 local = 08:00 UTC
        let early = Utc.with_ymd_and_hms(2024, 1, 15, 5, 0, 0).unwrap();
        assert_eq!(
            window.next_opening(early, tz),
            Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
        );

        // 18:00 UTC is 19:00 local, next opening is tomorrow
        let late = Utc.with_ymd_and_hms(2024, 1, 15, 18, 0, 0).unwrap();
        assert_eq!(
            window.next_opening(late, tz),
            Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_resolve_timezone_fallback() {
        assert_eq!(resolve_timezone(Some("Asia/Tokyo"), Tz::UTC), Tz::Asia__Tokyo);
        assert_eq!(resolve_timezone(Some("Mars/Olympus"), Tz::UTC), Tz::UTC);
        assert_eq!(resolve_timezone(None, Tz::UTC), Tz::UTC);
    }

    #[test]
    fn test_from_schedule_requires_both_bounds() {
        let schedule = ScheduleSettings {
            use_recipient_timezone: true,
            time_window_start: Some("09:00".into()),
            time_window_end: None,
            ..Default::default()
        };
        assert!(SendWindow::from_schedule(&schedule).is_err());

        let off = ScheduleSettings::default();
        assert_eq!(SendWindow::from_schedule(&off).unwrap(), None);
    }
}
