//! Scheduler: resolves each gated plant's effective setpoint and dispatches
//! it to the plant over Modbus, with hysteresis against register thrash.
//!
//! Grounded in the original source's `scheduler_agent.py` (as-of lookup,
//! "only write when changed" hysteresis, schedule-source switch between
//! `manual`/`api`) generalized onto `build_effective_schedule` for the
//! composed manual+API setpoint and onto `ModbusTransport` for the write.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{build_effective_schedule, PlantId};
use crate::modbus::{self, PlantTransport};
use crate::state::{ScheduleSource, SharedState};
use crate::time_utils;

const DISPATCH_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchWriteStatus {
    pub sending_enabled: bool,
    pub attempted_at: chrono::DateTime<Utc>,
    pub p_kw: f64,
    pub q_kvar: f64,
    pub source: &'static str,
    pub status: DispatchStatus,
    pub error: Option<String>,
}

/// Per-plant hysteresis + gate-transition tracking the scheduler needs
/// across ticks, kept local to the task (not shared state — nothing else
/// reads it).
#[derive(Default)]
struct PlantDispatchMemo {
    last_dispatched: Option<(f64, f64)>,
    was_gated_off: bool,
}

pub async fn run(
    shared: Arc<SharedState>,
    transports: std::collections::HashMap<PlantId, PlantTransport>,
    period: StdDuration,
) {
    let mut memo: std::collections::HashMap<PlantId, PlantDispatchMemo> = PlantId::ALL
        .into_iter()
        .map(|id| (id, PlantDispatchMemo::default()))
        .collect();

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("scheduler stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        for plant_id in PlantId::ALL {
            let gate_open = *shared.plant(plant_id).scheduler_running.read();
            let plant_memo = memo.get_mut(&plant_id).expect("seeded for every PlantId");

            if !gate_open {
                if !plant_memo.was_gated_off {
                    info!(plant = %plant_id, "scheduler dispatch paused");
                    plant_memo.was_gated_off = true;
                }
                continue;
            }
            plant_memo.was_gated_off = false;

            let Some(plant_transport) = transports.get(&plant_id) else {
                continue;
            };
            let mode = *shared.transport_mode.read();
            let (endpoint, transport) = plant_transport.resolve(mode);

            tick_one_plant(&shared, plant_id, endpoint, transport, plant_memo).await;
        }
    }
}

async fn tick_one_plant(
    shared: &SharedState,
    plant_id: PlantId,
    endpoint: &crate::modbus::ModbusEndpoint,
    transport: &dyn crate::modbus::ModbusTransport,
    memo: &mut PlantDispatchMemo,
) {
    let plant = shared.plant(plant_id);
    let source = *shared.active_schedule_source.read();

    let api_frame = plant.api_schedule.read().clone();
    let manual_p_key = crate::domain::ManualSeriesKey::for_plant(plant_id, crate::domain::schedule::Signal::P);
    let manual_q_key = crate::domain::ManualSeriesKey::for_plant(plant_id, crate::domain::schedule::Signal::Q);
    let manual_p = shared.manual_series.series[&manual_p_key].read().clone();
    let manual_q = shared.manual_series.series[&manual_q_key].read().clone();
    let manual_p_enabled = shared.manual_series.is_enabled(manual_p_key);
    let manual_q_enabled = shared.manual_series.is_enabled(manual_q_key);

    let effective = if source == ScheduleSource::Api {
        build_effective_schedule(&api_frame, &manual_p, manual_p_enabled, &manual_q, manual_q_enabled)
    } else {
        build_effective_schedule(&crate::domain::ScheduleFrame::new(), &manual_p, manual_p_enabled, &manual_q, manual_q_enabled)
    };
    *plant.effective_schedule.write() = effective.clone();

    let now = time_utils::now_in_tz(chrono_tz::UTC);
    let is_api_only = source == ScheduleSource::Api && manual_p.is_empty() && manual_q.is_empty();
    let (p_kw, q_kvar, _stale) = crate::domain::schedule::resolve_schedule_setpoint(
        &effective,
        now,
        is_api_only,
        crate::domain::schedule::API_STALE_WINDOW,
    );

    let source_label = if source == ScheduleSource::Api { "api" } else { "manual" };
    let attempted_at = Utc::now();

    let should_write = memo
        .last_dispatched
        .map(|(last_p, last_q)| (p_kw - last_p).abs() > DISPATCH_EPSILON || (q_kvar - last_q).abs() > DISPATCH_EPSILON)
        .unwrap_or(true);

    if !should_write {
        return;
    }

    let result = async {
        modbus::write_point(transport, endpoint, "p_setpoint", p_kw).await?;
        modbus::write_point(transport, endpoint, "q_setpoint", q_kvar).await?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    let status = match result {
        Ok(()) => {
            memo.last_dispatched = Some((p_kw, q_kvar));
            DispatchWriteStatus {
                sending_enabled: true,
                attempted_at,
                p_kw,
                q_kvar,
                source: source_label,
                status: DispatchStatus::Ok,
                error: None,
            }
        }
        Err(err) => {
            warn!(plant = %plant_id, error = %err, "scheduler dispatch write failed, will retry next tick");
            DispatchWriteStatus {
                sending_enabled: true,
                attempted_at,
                p_kw,
                q_kvar,
                source: source_label,
                status: DispatchStatus::Failed,
                error: Some(err.to_string()),
            }
        }
    };

    info!(plant = %plant_id, p_kw = status.p_kw, q_kvar = status.q_kvar, status = ?status.status, "scheduler dispatch");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ByteOrder, ManualSeries, ManualSeriesKey, PlantModel, PointAccess, PointSpec, RegisterFormat,
        ScheduleFrame, WordOrder,
    };
    use crate::modbus::{LocalTransport, ModbusEndpoint, RegisterBank};
    use chrono::Duration;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn dispatch_epsilon_suppresses_noise_level_changes() {
        let memo = PlantDispatchMemo {
            last_dispatched: Some((10.0, 0.0)),
            was_gated_off: false,
        };
        let delta = (10.005_f64 - 10.0).abs();
        assert!(delta <= DISPATCH_EPSILON);
        let _ = memo;
    }

    #[test]
    fn empty_frame_resolves_to_zero() {
        let frame = ScheduleFrame::new();
        assert!(frame.asof(time_utils::now_in_tz(chrono_tz::UTC)).is_none());
    }

    fn endpoint() -> ModbusEndpoint {
        let mut points = StdHashMap::new();
        points.insert("p_setpoint".to_string(), PointSpec { address: 0, format: RegisterFormat::Int32, access: PointAccess::Rw, unit: "kW".to_string(), eng_per_count: 0.1 });
        points.insert("q_setpoint".to_string(), PointSpec { address: 4, format: RegisterFormat::Int32, access: PointAccess::Rw, unit: "kvar".to_string(), eng_per_count: 0.1 });
        ModbusEndpoint { host: "localhost".to_string(), port: 5020, byte_order: ByteOrder::Big, word_order: WordOrder::MswFirst, points }
    }

    fn model() -> PlantModel {
        PlantModel { capacity_kwh: 100.0, p_max_kw: 50.0, p_min_kw: -50.0, q_max_kvar: 20.0, q_min_kvar: -20.0, poi_voltage_kv: 11.0 }
    }

    /// Composes an API base frame with an enabled manual P override
    /// straddling `now`, then writes the composed setpoint through the
    /// resolved transport.
    #[tokio::test]
    async fn tick_composes_manual_override_over_api_base_and_dispatches_it() {
        let now = time_utils::now_in_tz(chrono_tz::UTC);

        let mut models = StdHashMap::new();
        models.insert(PlantId::Lib, model());
        models.insert(PlantId::Vrfb, model());
        let shared = SharedState::new(models, "manual", "local", Utc::now());
        *shared.active_schedule_source.write() = ScheduleSource::Api;
        *shared.plant(PlantId::Lib).scheduler_running.write() = true;

        let api_frame = ScheduleFrame::from_rows([(now - Duration::hours(1), 10.0, 1.0)]);
        *shared.plant(PlantId::Lib).api_schedule.write() = api_frame;

        let manual_p_key = ManualSeriesKey::for_plant(PlantId::Lib, crate::domain::schedule::Signal::P);
        let manual_p = ManualSeries::from_rows([
            (now - Duration::minutes(10), 99.0),
            (now + Duration::minutes(10), 99.0),
        ]);
        *shared.manual_series.series[&manual_p_key].write() = manual_p;
        *shared.manual_series.merge_enabled.get(&manual_p_key).unwrap().write() = true;

        let bank = RegisterBank::new();
        let transport = LocalTransport::new(bank);
        let endpoint = endpoint();
        let mut memo = PlantDispatchMemo::default();

        tick_one_plant(&shared, PlantId::Lib, &endpoint, &transport, &mut memo).await;

        let p_written = modbus::read_point(&transport, &endpoint, "p_setpoint").await.unwrap();
        let q_written = modbus::read_point(&transport, &endpoint, "q_setpoint").await.unwrap();
        assert!((p_written - 99.0).abs() < 0.1, "expected manual override p to win, got {p_written}");
        assert!((q_written - 1.0).abs() < 0.1, "expected api q to pass through unchanged, got {q_written}");
        assert_eq!(memo.last_dispatched, Some((99.0, 1.0)));
    }
}
