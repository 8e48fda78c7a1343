//! Centralized timezone handling.
//!
//! Every timestamp that enters shared state must pass through here first.
//! Naive datetimes are never stored; callers declare whether a naive value
//! should be interpreted in the configured site timezone or as UTC.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_TIMEZONE_NAME: &str = "Europe/Madrid";

/// How a naive (tz-less) timestamp should be interpreted when normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaivePolicy {
    AssumeConfigTz,
    AssumeUtc,
}

pub fn parse_timezone(name: &str) -> anyhow::Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| anyhow::anyhow!("unknown timezone '{name}'"))
}

/// Normalize a naive datetime into an unambiguous `DateTime<Tz>` under the
/// given policy, then reproject into the site timezone.
pub fn normalize_naive(naive: NaiveDateTime, tz: Tz, policy: NaivePolicy) -> DateTime<Tz> {
    match policy {
        NaivePolicy::AssumeConfigTz => tz
            .from_local_datetime(&naive)
            .single()
            .unwrap_or_else(|| tz.from_utc_datetime(&naive)),
        NaivePolicy::AssumeUtc => Utc.from_utc_datetime(&naive).with_timezone(&tz),
    }
}

pub fn now_in_tz(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// Start of the local calendar day containing `at`, in the site timezone.
pub fn local_midnight(at: DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    tz_from_naive_date(at.timezone(), date)
}

fn tz_from_naive_date(tz: Tz, date: chrono::NaiveDate) -> DateTime<Tz> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    tz.from_local_datetime(&naive)
        .single()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

/// The live window manual series are pruned to: `[today_00:00, today_00:00+2d)`.
pub fn live_manual_window(now: DateTime<Tz>) -> (DateTime<Tz>, DateTime<Tz>) {
    let start = local_midnight(now);
    let end = start + chrono::Duration::days(2);
    (start, end)
}

pub fn serialize_iso_with_tz(at: DateTime<Tz>) -> String {
    at.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_timezone() {
        let tz = parse_timezone(DEFAULT_TIMEZONE_NAME).unwrap();
        assert_eq!(tz.to_string(), "Europe/Madrid");
    }

    #[test]
    fn live_window_spans_two_days() {
        let tz = parse_timezone(DEFAULT_TIMEZONE_NAME).unwrap();
        let now = now_in_tz(tz);
        let (start, end) = live_manual_window(now);
        assert_eq!((end - start).num_days(), 2);
        assert!(start <= now);
    }

    #[test]
    fn unknown_timezone_errors() {
        assert!(parse_timezone("Not/AZone").is_err());
    }
}
