//! Vendor `/Date(<millis>)/` values.

use chrono::{DateTime, Local, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

lazy_static::lazy_static! {
    // .NET JSON dates; the optional offset is informational, millis are always UTC.
    static ref WRAPPED_DATE: Regex = Regex::new(r"^/Date\((-?\d+)(?:[+-]\d{4})?\)/$").unwrap();
}

/// Display format for report dates.
const DISPLAY_FORMAT: &str = "%d-%m-%Y";

/// Timezone used to turn vendor timestamps into calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayZone {
    /// The host's local timezone.
    Local,
    Named(Tz),
}

/// Extract the millisecond timestamp from a wrapped vendor date.
pub fn parse_wrapped_millis(raw: &str) -> Option<i64> {
    let caps = WRAPPED_DATE.captures(raw.trim())?;
    caps[1].parse().ok()
}

/// Render a wrapped vendor date as `DD-MM-YYYY`.
///
/// Empty input renders as an empty string; `None` means the value is not a
/// wrapped date at all.
pub fn format_vendor_date(raw: &str, zone: DisplayZone) -> Option<String> {
    if raw.trim().is_empty() {
        return Some(String::new());
    }

    let millis = parse_wrapped_millis(raw)?;
    let utc = DateTime::<Utc>::from_timestamp_millis(millis)?;
    Some(match zone {
        DisplayZone::Local => render(&Local, utc),
        DisplayZone::Named(tz) => render(&tz, utc),
    })
}

fn render<Z: TimeZone>(zone: &Z, at: DateTime<Utc>) -> String
where
    Z::Offset: std::fmt::Display,
{
    at.with_timezone(zone).format(DISPLAY_FORMAT).to_string()
}
