//! Recorded measurement rows and the normalized items built from them for
//! posting to the day-ahead API.
//!
//! Grounded in the original source's `measurement_sampling.py` (row shape,
//! `soc_pu`/`v_poi_pu` per-unit scaling) and `measurement_posting.py`
//! (`build_post_items`: soc/p/q/v metric fan-out with engineering-unit
//! conversion and a UTC ISO-8601 timestamp).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PlantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostMetric {
    Soc,
    P,
    Q,
    V,
}

impl PostMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostMetric::Soc => "soc",
            PostMetric::P => "p",
            PostMetric::Q => "q",
            PostMetric::V => "v",
        }
    }
}

/// One sampled row, read from the plant's measurement registers at the
/// sampler cadence. Per-unit fields (`soc_pu`, `v_poi_pu`) match the
/// source's hardware scaling; `p_poi_kw`/`q_poi_kvar` are already in
/// engineering units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub timestamp: DateTime<Utc>,
    pub p_setpoint_kw: Option<f64>,
    pub battery_active_power_kw: Option<f64>,
    pub q_setpoint_kvar: Option<f64>,
    pub battery_reactive_power_kvar: Option<f64>,
    pub soc_pu: Option<f64>,
    pub p_poi_kw: Option<f64>,
    pub q_poi_kvar: Option<f64>,
    pub v_poi_pu: Option<f64>,
}

/// One normalized post payload entry: a metric, the configured series id for
/// that metric, a value in base engineering units (kWh, W, var, V), and a
/// UTC timestamp already formatted as an offset string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostItem {
    pub plant_id: PlantId,
    pub metric: PostMetric,
    pub series_id: Option<String>,
    pub value: Option<f64>,
    pub timestamp_iso: String,
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Replace non-finite sampled values with `None` and fan a row out into its
/// four post items (soc in kWh, p in W, q in var, v in V), using the
/// plant's nameplate capacity and nominal POI voltage to convert from
/// per-unit.
pub fn build_post_items(
    plant_id: PlantId,
    row: &MeasurementRow,
    capacity_kwh: f64,
    poi_voltage_v: f64,
    series_ids: &PostSeriesIds,
) -> Vec<PostItem> {
    let timestamp_iso = row.timestamp.format("%Y-%m-%dT%H:%M:%S+00:00").to_string();

    let soc_value = finite(row.soc_pu).map(|pu| pu * capacity_kwh);
    let p_value = finite(row.p_poi_kw).map(|kw| kw * 1000.0);
    let q_value = finite(row.q_poi_kvar).map(|kvar| kvar * 1000.0);
    let v_value = finite(row.v_poi_pu).map(|pu| pu * poi_voltage_v);

    vec![
        PostItem {
            plant_id,
            metric: PostMetric::Soc,
            series_id: series_ids.soc.clone(),
            value: soc_value,
            timestamp_iso: timestamp_iso.clone(),
        },
        PostItem {
            plant_id,
            metric: PostMetric::P,
            series_id: series_ids.p.clone(),
            value: p_value,
            timestamp_iso: timestamp_iso.clone(),
        },
        PostItem {
            plant_id,
            metric: PostMetric::Q,
            series_id: series_ids.q.clone(),
            value: q_value,
            timestamp_iso: timestamp_iso.clone(),
        },
        PostItem {
            plant_id,
            metric: PostMetric::V,
            series_id: series_ids.v.clone(),
            value: v_value,
            timestamp_iso,
        },
    ]
}

/// The configured series identifiers a plant posts its four metrics under.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostSeriesIds {
    pub soc: Option<String>,
    pub p: Option<String>,
    pub q: Option<String>,
    pub v: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> MeasurementRow {
        MeasurementRow {
            timestamp: DateTime::parse_from_rfc3339("2026-07-27T10:00:00Z").unwrap().with_timezone(&Utc),
            p_setpoint_kw: Some(100.0),
            battery_active_power_kw: Some(99.0),
            q_setpoint_kvar: Some(0.0),
            battery_reactive_power_kvar: Some(0.0),
            soc_pu: Some(0.5),
            p_poi_kw: Some(98.0),
            q_poi_kvar: Some(1.0),
            v_poi_pu: Some(1.0),
        }
    }

    #[test]
    fn converts_per_unit_to_engineering_values() {
        let ids = PostSeriesIds {
            soc: Some("s1".into()),
            p: Some("s2".into()),
            q: Some("s3".into()),
            v: Some("s4".into()),
        };
        let items = build_post_items(PlantId::Lib, &row(), 200.0, 800.0, &ids);
        assert_eq!(items[0].value, Some(100.0)); // 0.5 * 200 kWh
        assert_eq!(items[1].value, Some(98_000.0)); // 98 kW -> W
        assert_eq!(items[2].value, Some(1_000.0)); // 1 kvar -> var
        assert_eq!(items[3].value, Some(800.0)); // 1.0 pu * 800 kV... V
    }

    #[test]
    fn non_finite_values_become_none() {
        let mut r = row();
        r.soc_pu = Some(f64::NAN);
        let ids = PostSeriesIds::default();
        let items = build_post_items(PlantId::Lib, &r, 200.0, 800.0, &ids);
        assert_eq!(items[0].value, None);
    }

    #[test]
    fn timestamp_is_utc_offset_formatted() {
        let ids = PostSeriesIds::default();
        let items = build_post_items(PlantId::Lib, &row(), 200.0, 800.0, &ids);
        assert_eq!(items[0].timestamp_iso, "2026-07-27T10:00:00+00:00");
    }
}
