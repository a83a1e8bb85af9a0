use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Workbook date system used to interpret serial date values.
///
/// - `Excel1900` (default; includes the Lotus 1-2-3 leap year bug)
/// - `Excel1904` (`<workbookPr date1904="1"/>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DateSystem {
    #[default]
    #[serde(rename = "excel1900")]
    Excel1900,
    #[serde(rename = "excel1904")]
    Excel1904,
}

const MILLIS_PER_DAY: f64 = 86_400_000.0;

fn epoch(system: DateSystem, serial_days: i64) -> Option<NaiveDateTime> {
    let date = match system {
        // Serial 60 is the phantom 1900-02-29; serials after it are shifted by one day.
        DateSystem::Excel1900 if serial_days < 60 => NaiveDate::from_ymd_opt(1899, 12, 31)?,
        DateSystem::Excel1900 => NaiveDate::from_ymd_opt(1899, 12, 30)?,
        DateSystem::Excel1904 => NaiveDate::from_ymd_opt(1904, 1, 1)?,
    };
    date.and_hms_opt(0, 0, 0)
}

/// Convert a serial number to a date-time. Returns `None` for negative or non-finite serials.
pub fn serial_to_datetime(serial: f64, system: DateSystem) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let days = serial.trunc() as i64;
    let base = epoch(system, days)?;
    let millis = ((serial - serial.trunc()) * MILLIS_PER_DAY).round() as i64;
    base.checked_add_signed(Duration::days(days))?
        .checked_add_signed(Duration::milliseconds(millis))
}

/// Convert a date-time to a serial number in `system`.
pub fn datetime_to_serial(value: NaiveDateTime, system: DateSystem) -> f64 {
    let before_phantom_day = NaiveDate::from_ymd_opt(1900, 3, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .is_some_and(|march| value < march);
    let serial_hint = if before_phantom_day { 0 } else { 60 };
    let Some(base) = epoch(system, serial_hint) else {
        return 0.0;
    };
    let delta = value - base;
    let millis = delta.num_milliseconds() as f64;
    millis / MILLIS_PER_DAY
}
