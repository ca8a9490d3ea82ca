use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::ConfigError;

/// Maps instants onto monthly quota periods (`YYYY-MM`) in a fixed IANA zone.
#[derive(Debug, Clone, Copy)]
pub struct PeriodClock {
    zone: Tz,
}

impl PeriodClock {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| ConfigError::InvalidTimezone(name.to_string()))
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn current_period(&self) -> String {
        self.period_at(Utc::now())
    }

    pub fn period_at(&self, instant: DateTime<Utc>) -> String {
        instant.with_timezone(&self.zone).format("%Y-%m").to_string()
    }

    pub fn next_reset_at(&self) -> DateTime<Tz> {
        self.next_reset_after(Utc::now())
    }

    /// First instant of the month following `instant`, in the clock's zone.
    pub fn next_reset_after(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        let local = instant.with_timezone(&self.zone);
        let (year, month) = if local.month() == 12 {
            (local.year() + 1, 1)
        } else {
            (local.year(), local.month() + 1)
        };
        let midnight = NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();

        // Midnight can fall into a DST gap in a few zones; the first valid
        // instant after it is the reset.
        let mut candidate = midnight;
        for _ in 0..4 {
            if let Some(dt) = self.zone.from_local_datetime(&candidate).earliest() {
                return dt;
            }
            candidate += chrono::Duration::minutes(30);
        }
        self.zone.from_utc_datetime(&midnight)
    }
}
