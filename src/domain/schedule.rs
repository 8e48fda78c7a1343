//! Schedule frames, manual override series, and their composition into an
//! effective per-plant dispatch schedule.
//!
//! Grounded in the original source's `scheduling/runtime.py` (frame
//! composition, as-of resolution, staleness) and
//! `scheduling/manual_schedule_manager.py` (terminal duplicate-row end
//! marker, minimum row gap, live-window pruning).

use chrono::{DateTime, Duration};
use chrono_tz::Tz;
use std::collections::BTreeMap;

use crate::domain::plant::PlantId;

/// Minimum gap enforced between successive manual override rows.
pub const MIN_MANUAL_ROW_GAP_S: i64 = 60;

/// Default staleness window for an API-sourced schedule with no manual
/// overrides: older than this, the resolver falls back to `(0, 0)`.
pub const API_STALE_WINDOW: Duration = Duration::minutes(15);

/// An ordered, piecewise-constant power schedule: `(p_setpoint_kw,
/// q_setpoint_kvar)` held from each timestamp until the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleFrame {
    rows: BTreeMap<DateTime<Tz>, (f64, f64)>,
}

impl ScheduleFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (DateTime<Tz>, f64, f64)>) -> Self {
        let mut frame = Self::new();
        for (ts, p, q) in rows {
            frame.insert(ts, p, q);
        }
        frame
    }

    pub fn insert(&mut self, ts: DateTime<Tz>, p_kw: f64, q_kvar: f64) {
        self.rows.insert(ts, (p_kw, q_kvar));
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Tz>> {
        self.rows.keys().next_back().copied()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Tz>> {
        self.rows.keys().next().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Tz>, &(f64, f64))> {
        self.rows.iter()
    }

    /// Greatest-index-at-or-before lookup (`asof`). `None` when `now` is
    /// before the first row or the frame is empty.
    pub fn asof(&self, now: DateTime<Tz>) -> Option<(f64, f64)> {
        self.rows.range(..=now).next_back().map(|(_, v)| *v)
    }

    pub fn timestamp_asof(&self, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.rows.range(..=now).next_back().map(|(ts, _)| *ts)
    }

    /// Replace all rows in `[start, end)` with `new_rows`, leaving rows
    /// outside the window untouched. Used by the data fetcher to atomically
    /// swap in a freshly-fetched today/tomorrow slice.
    pub fn replace_window(
        &mut self,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
        new_rows: impl IntoIterator<Item = (DateTime<Tz>, f64, f64)>,
    ) {
        self.rows.retain(|ts, _| *ts < start || *ts >= end);
        for (ts, p, q) in new_rows {
            self.rows.insert(ts, (p, q));
        }
    }
}

/// `resolve_schedule_setpoint`: returns `(p_kw, q_kvar, api_is_stale)`.
/// `api_is_stale` is `Some(_)` only when `is_api_source` is true.
pub fn resolve_schedule_setpoint(
    frame: &ScheduleFrame,
    now: DateTime<Tz>,
    is_api_source: bool,
    stale_window: Duration,
) -> (f64, f64, Option<bool>) {
    if frame.is_empty() {
        return (0.0, 0.0, is_api_source.then_some(true));
    }
    let row_ts = frame.timestamp_asof(now);
    let Some(row_ts) = row_ts else {
        return (0.0, 0.0, is_api_source.then_some(true));
    };
    let (mut p, mut q) = frame.asof(now).unwrap_or((0.0, 0.0));

    let stale = if is_api_source {
        let is_stale = now - row_ts > stale_window;
        if is_stale {
            p = 0.0;
            q = 0.0;
        }
        Some(is_stale)
    } else {
        None
    };
    (p, q, stale)
}

/// One of the four manually-overridable signal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManualSeriesKey {
    LibP,
    LibQ,
    VrfbP,
    VrfbQ,
}

impl ManualSeriesKey {
    pub const ALL: [ManualSeriesKey; 4] = [
        ManualSeriesKey::LibP,
        ManualSeriesKey::LibQ,
        ManualSeriesKey::VrfbP,
        ManualSeriesKey::VrfbQ,
    ];

    pub fn for_plant(plant_id: PlantId, signal: Signal) -> Self {
        match (plant_id, signal) {
            (PlantId::Lib, Signal::P) => ManualSeriesKey::LibP,
            (PlantId::Lib, Signal::Q) => ManualSeriesKey::LibQ,
            (PlantId::Vrfb, Signal::P) => ManualSeriesKey::VrfbP,
            (PlantId::Vrfb, Signal::Q) => ManualSeriesKey::VrfbQ,
        }
    }

    pub fn plant_id(&self) -> PlantId {
        match self {
            ManualSeriesKey::LibP | ManualSeriesKey::LibQ => PlantId::Lib,
            ManualSeriesKey::VrfbP | ManualSeriesKey::VrfbQ => PlantId::Vrfb,
        }
    }

    pub fn signal(&self) -> Signal {
        match self {
            ManualSeriesKey::LibP | ManualSeriesKey::VrfbP => Signal::P,
            ManualSeriesKey::LibQ | ManualSeriesKey::VrfbQ => Signal::Q,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ManualSeriesKey::LibP => "lib_p",
            ManualSeriesKey::LibQ => "lib_q",
            ManualSeriesKey::VrfbP => "vrfb_p",
            ManualSeriesKey::VrfbQ => "vrfb_q",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    P,
    Q,
}

/// A manual override series for one signal: sorted `(timestamp, setpoint)`
/// rows, possibly carrying a terminal duplicate-row end marker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualSeries {
    rows: BTreeMap<DateTime<Tz>, f64>,
}

/// Result of splitting a manual series into its value rows and, if present,
/// the terminal end-of-override instant. The single canonical function the
/// rest of the system uses to interpret the end-marker encoding.
pub struct SplitManualSeries {
    pub series: ManualSeries,
    pub end_ts: Option<DateTime<Tz>>,
}

impl ManualSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = (DateTime<Tz>, f64)>) -> Self {
        let mut series = Self::new();
        for (ts, v) in rows {
            series.rows.insert(ts, v);
        }
        series
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DateTime<Tz>, &f64)> {
        self.rows.iter()
    }

    pub fn asof(&self, now: DateTime<Tz>) -> Option<f64> {
        self.rows.range(..=now).next_back().map(|(_, v)| *v)
    }

    /// Detect the terminal duplicate-row end marker: last two rows share a
    /// setpoint at strictly increasing timestamps.
    pub fn split(&self) -> SplitManualSeries {
        if self.rows.len() < 2 {
            return SplitManualSeries {
                series: self.clone(),
                end_ts: None,
            };
        }
        let mut iter = self.rows.iter().rev();
        let (last_ts, last_v) = iter.next().unwrap();
        let (prev_ts, prev_v) = iter.next().unwrap();
        if prev_ts < last_ts && (prev_v - last_v).abs() == 0.0 {
            SplitManualSeries {
                series: self.clone(),
                end_ts: Some(*last_ts),
            }
        } else {
            SplitManualSeries {
                series: self.clone(),
                end_ts: None,
            }
        }
    }

    /// Auto-complete a series without a terminal end row by duplicating the
    /// last value at `last_ts + 60s`.
    pub fn ensure_terminal_duplicate_row(&self) -> ManualSeries {
        if self.rows.is_empty() {
            return self.clone();
        }
        let split = self.split();
        if split.end_ts.is_some() {
            return self.clone();
        }
        let (&last_ts, &last_v) = self.rows.iter().next_back().unwrap();
        let mut completed = self.clone();
        completed
            .rows
            .insert(last_ts + Duration::seconds(MIN_MANUAL_ROW_GAP_S), last_v);
        completed
    }

    /// Prune rows outside `[window_start, window_end)`, but keep a terminal
    /// end-marker row exactly at or after `window_end` so the end instant is
    /// never silently lost by pruning.
    pub fn prune_to_window(&self, window_start: DateTime<Tz>, window_end: DateTime<Tz>) -> ManualSeries {
        let completed = self.ensure_terminal_duplicate_row();
        let end_ts = completed.split().end_ts;
        let mut pruned = BTreeMap::new();
        for (ts, v) in completed.rows.iter() {
            let keep_by_window = *ts >= window_start && *ts < window_end;
            let keep_as_end_marker = end_ts == Some(*ts) && *ts >= window_end;
            if keep_by_window || keep_as_end_marker {
                pruned.insert(*ts, *v);
            }
        }
        ManualSeries { rows: pruned }
    }

    /// Validate editor-style invariants: first offset zero, strictly
    /// increasing offsets, minimum 60s gap between rows.
    pub fn validate_offsets(&self) -> Result<(), String> {
        let mut prev: Option<DateTime<Tz>> = None;
        for (i, (ts, _)) in self.rows.iter().enumerate() {
            if let Some(prev_ts) = prev {
                if (*ts - prev_ts).num_seconds() < MIN_MANUAL_ROW_GAP_S {
                    return Err(format!(
                        "row {i}: minimum gap of {MIN_MANUAL_ROW_GAP_S}s violated"
                    ));
                }
            }
            prev = Some(*ts);
        }
        Ok(())
    }
}

/// Build the effective per-plant schedule: API base, left-filled, with
/// manual P/Q overrides applied where enabled and before their end instant.
pub fn build_effective_schedule(
    api: &ScheduleFrame,
    manual_p: &ManualSeries,
    manual_p_enabled: bool,
    manual_q: &ManualSeries,
    manual_q_enabled: bool,
) -> ScheduleFrame {
    let p_split = manual_p.split();
    let q_split = manual_q.split();

    let mut union_ts: Vec<DateTime<Tz>> = api.rows.keys().copied().collect();
    union_ts.extend(p_split.series.rows.keys().copied());
    union_ts.extend(q_split.series.rows.keys().copied());
    if let Some(end_ts) = p_split.end_ts {
        union_ts.push(end_ts);
    }
    if let Some(end_ts) = q_split.end_ts {
        union_ts.push(end_ts);
    }
    union_ts.sort();
    union_ts.dedup();

    let mut effective = ScheduleFrame::new();
    let mut last_api: Option<(f64, f64)> = None;
    let mut last_p_override: Option<f64> = None;
    let mut last_q_override: Option<f64> = None;

    for ts in union_ts {
        if let Some(row) = api.rows.get(&ts) {
            last_api = Some(*row);
        }
        let (mut p, mut q) = last_api.unwrap_or((0.0, 0.0));

        if let Some(v) = p_split.series.rows.get(&ts) {
            last_p_override = Some(*v);
        }
        if let Some(v) = q_split.series.rows.get(&ts) {
            last_q_override = Some(*v);
        }

        if manual_p_enabled {
            let before_end = p_split.end_ts.map(|end| ts < end).unwrap_or(true);
            if before_end {
                if let Some(v) = last_p_override {
                    p = v;
                }
            }
        }
        if manual_q_enabled {
            let before_end = q_split.end_ts.map(|end| ts < end).unwrap_or(true);
            if before_end {
                if let Some(v) = last_q_override {
                    q = v;
                }
            }
        }

        effective.insert(ts, p, q);
    }
    effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_utils::parse_timezone;
    use chrono::TimeZone;

    fn tz() -> Tz {
        parse_timezone("Europe/Madrid").unwrap()
    }

    fn ts(tz: Tz, h: u32, m: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(2026, 7, 26, h, m, 0).unwrap()
    }

    #[test]
    fn asof_before_first_row_is_none() {
        let tz = tz();
        let frame = ScheduleFrame::from_rows([(ts(tz, 10, 0), 5.0, 0.0)]);
        assert_eq!(frame.asof(ts(tz, 9, 0)), None);
        assert_eq!(frame.asof(ts(tz, 10, 30)), Some((5.0, 0.0)));
    }

    #[test]
    fn api_only_source_goes_stale_after_window() {
        let tz = tz();
        let frame = ScheduleFrame::from_rows([(ts(tz, 8, 0), 100.0, 0.0)]);
        let (p, q, stale) = resolve_schedule_setpoint(&frame, ts(tz, 8, 20), true, API_STALE_WINDOW);
        assert_eq!((p, q), (0.0, 0.0));
        assert_eq!(stale, Some(true));
    }

    #[test]
    fn terminal_duplicate_row_detected() {
        let tz = tz();
        let series = ManualSeries::from_rows([
            (ts(tz, 0, 0), 50.0),
            (ts(tz, 1, 0), 50.0),
        ]);
        let split = series.split();
        assert_eq!(split.end_ts, Some(ts(tz, 1, 0)));
    }

    #[test]
    fn series_without_end_row_is_auto_completed() {
        let tz = tz();
        let series = ManualSeries::from_rows([(ts(tz, 0, 0), 50.0)]);
        let completed = series.ensure_terminal_duplicate_row();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed.split().end_ts, Some(ts(tz, 0, 1)));
    }

    #[test]
    fn effective_schedule_reverts_to_api_after_override_end() {
        let tz = tz();
        let api = ScheduleFrame::from_rows([(ts(tz, 0, 0), 10.0, 1.0)]);
        let manual_p = ManualSeries::from_rows([
            (ts(tz, 0, 30), 99.0),
            (ts(tz, 1, 0), 99.0),
        ]);
        let effective = build_effective_schedule(&api, &manual_p, true, &ManualSeries::new(), false);

        let (p_during, _, _) = resolve_schedule_setpoint(&effective, ts(tz, 0, 45), false, API_STALE_WINDOW);
        assert_eq!(p_during, 99.0);

        let (p_after, q_after, _) = resolve_schedule_setpoint(&effective, ts(tz, 1, 30), false, API_STALE_WINDOW);
        assert_eq!(p_after, 10.0);
        assert_eq!(q_after, 1.0);
    }

    #[test]
    fn prune_to_window_keeps_end_marker_past_end() {
        let tz = tz();
        let series = ManualSeries::from_rows([
            (ts(tz, 0, 0), 10.0),
            (ts(tz, 0, 1), 10.0),
        ]);
        let pruned = series.prune_to_window(ts(tz, 0, 0), ts(tz, 0, 0) + Duration::seconds(30));
        assert_eq!(pruned.split().end_ts, Some(ts(tz, 0, 1)));
    }
}
