//! Control Engine (§4.6): single-consumer drainer of the control command
//! queue. Starts/stops plants, toggles dispatch and recording gates, runs
//! the safe-stop sub-protocol, and switches transport mode.
//!
//! Grounded in the original source's `control/engine_agent.py`: the
//! refresh-dequeue-refresh cycle, the `starting/running/stopping/stopped`
//! transition guard around `plant.start`/`plant.stop`, and the
//! local-transport SoC-seed-request-then-timeout pattern before enabling a
//! plant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::{CommandState, PlantId, ReadStatus, TransitionState, TransportMode};
use crate::modbus::{self, PlantTransport};
use crate::state::{ScheduleSource, SharedState};
use crate::time_utils;

const LOOP_PERIOD_S: f64 = 1.0;
const OBSERVED_STALE_AFTER: chrono::Duration = crate::domain::observed::DEFAULT_STALE_AFTER;
const SAFE_STOP_THRESHOLD_KW: f64 = 1.0;
const SAFE_STOP_TIMEOUT_S: f64 = 30.0;
const SOC_SEED_TIMEOUT_S: f64 = 1.5;

pub fn default_loop_period() -> StdDuration {
    StdDuration::from_millis((LOOP_PERIOD_S * 1000.0) as u64)
}

/// Run the Control Engine loop until shutdown is signaled.
pub async fn run(shared: Arc<SharedState>, transports: HashMap<PlantId, PlantTransport>, period: StdDuration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let mut status = shared.control_engine_status.write();
                status.alive = false;
                status.last_loop_end = Some(Utc::now());
                info!("control engine stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        run_single_cycle(&shared, &transports).await;
    }
}

async fn run_single_cycle(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>) {
    let loop_start = Utc::now();
    {
        let mut status = shared.control_engine_status.write();
        status.alive = true;
        status.last_loop_start = Some(loop_start);
    }

    refresh_all_observed_state(shared, transports).await;
    {
        let mut status = shared.control_engine_status.write();
        status.last_observed_refresh = Some(Utc::now());
    }

    let command = { shared.control_commands.write().try_dequeue() };
    if let Some(command) = command {
        let started_at = Utc::now();
        {
            let mut queue = shared.control_commands.write();
            queue.mark_running(&command.id, started_at);
        }
        {
            let mut status = shared.control_engine_status.write();
            status.active_command_id = Some(command.id.clone());
        }

        let (state, message, result) = match execute_command(shared, transports, &command).await {
            Ok((message, result)) => (CommandState::Succeeded, message, result),
            Err((message, result)) => (CommandState::Failed, Some(message), result),
        };
        let finished_at = Utc::now();
        let finished = {
            let mut queue = shared.control_commands.write();
            queue.mark_finished(&command.id, state, message.as_deref(), result, finished_at)
        };

        let mut status = shared.control_engine_status.write();
        status.active_command_id = None;
        status.last_finished_command = Some(finished.id.clone());

        refresh_all_observed_state(shared, transports).await;
        let mut status = shared.control_engine_status.write();
        status.last_observed_refresh = Some(Utc::now());
    }

    let queue = shared.control_commands.read();
    let mut status = shared.control_engine_status.write();
    status.queue_depth = queue.queue_depth();
    status.queued_count = queue.queue_depth();
    status.running_count = queue.running_count();
    status.last_loop_end = Some(Utc::now());
}

async fn refresh_all_observed_state(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>) {
    let mode = *shared.transport_mode.read();
    for plant_id in PlantId::ALL {
        let Some(plant_transport) = transports.get(&plant_id) else { continue };
        let (endpoint, transport) = plant_transport.resolve(mode);
        let now = Utc::now();
        let mut observed = shared.plant(plant_id).observed.write();

        let enable = modbus::read_point(transport, endpoint, "enable").await;
        let p_battery = modbus::read_point(transport, endpoint, "p_battery").await;
        let q_battery = modbus::read_point(transport, endpoint, "q_battery").await;

        match (enable, p_battery, q_battery) {
            (Ok(enable), Ok(p), Ok(q)) => observed.mark_success(now, enable as u16, p, q),
            _ => observed.mark_failure(now, ReadStatus::ReadError, "read_error", "one or more observed points failed to read"),
        }
        observed.recompute_staleness(now, OBSERVED_STALE_AFTER);
    }
}

type HandlerResult = Result<(Option<String>, Option<serde_json::Value>), (String, Option<serde_json::Value>)>;

async fn execute_command(
    shared: &SharedState,
    transports: &HashMap<PlantId, PlantTransport>,
    command: &crate::domain::Command,
) -> HandlerResult {
    let payload = &command.payload;
    match command.kind.as_str() {
        "plant.start" => {
            let Some(plant_id) = parse_plant_id(payload) else {
                return Err(("invalid_plant_id".to_string(), None));
            };
            start_one_plant(shared, transports, plant_id).await
        }
        "plant.stop" => {
            let Some(plant_id) = parse_plant_id(payload) else {
                return Err(("invalid_plant_id".to_string(), None));
            };
            stop_one_plant(shared, transports, plant_id).await
        }
        "plant.dispatch_enable" => {
            let Some(plant_id) = parse_plant_id(payload) else {
                return Err(("invalid_plant_id".to_string(), None));
            };
            let previous = { let mut gate = shared.plant(plant_id).scheduler_running.write(); let prev = *gate; *gate = true; prev };
            Ok((None, Some(json!({"previous": previous, "current": true}))))
        }
        "plant.dispatch_disable" => {
            let Some(plant_id) = parse_plant_id(payload) else {
                return Err(("invalid_plant_id".to_string(), None));
            };
            let previous = { let mut gate = shared.plant(plant_id).scheduler_running.write(); let prev = *gate; *gate = false; prev };
            Ok((None, Some(json!({"previous": previous, "current": false}))))
        }
        "plant.record_start" => {
            let Some(plant_id) = parse_plant_id(payload) else {
                return Err(("invalid_plant_id".to_string(), None));
            };
            let mut enabled = shared.plant(plant_id).recording_enabled.write();
            let noop = *enabled;
            *enabled = true;
            Ok((None, Some(json!({"noop": noop}))))
        }
        "plant.record_stop" => {
            let Some(plant_id) = parse_plant_id(payload) else {
                return Err(("invalid_plant_id".to_string(), None));
            };
            let mut enabled = shared.plant(plant_id).recording_enabled.write();
            let noop = !*enabled;
            *enabled = false;
            Ok((None, Some(json!({"noop": noop}))))
        }
        "fleet.start_all" => fleet_start_all(shared, transports).await,
        "fleet.stop_all" => fleet_stop_all(shared, transports).await,
        "transport.switch" => transport_switch(shared, transports, payload).await,
        other => Err(("unsupported_command".to_string(), Some(json!({"kind": other})))),
    }
}

fn parse_plant_id(payload: &serde_json::Value) -> Option<PlantId> {
    match payload.get("plant_id").and_then(|v| v.as_str()) {
        Some("lib") => Some(PlantId::Lib),
        Some("vrfb") => Some(PlantId::Vrfb),
        _ => None,
    }
}

async fn start_one_plant(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>, plant_id: PlantId) -> HandlerResult {
    {
        let mut transition = shared.plant(plant_id).transition.write();
        if matches!(*transition, TransitionState::Starting | TransitionState::Running) {
            return Err(("already_running".to_string(), Some(json!({"transition_state": format!("{:?}", *transition)}))));
        }
        *transition = TransitionState::Starting;
    }

    let Some(plant_transport) = transports.get(&plant_id) else {
        *shared.plant(plant_id).transition.write() = TransitionState::Stopped;
        return Err(("no_transport_configured".to_string(), None));
    };
    let mode = *shared.transport_mode.read();
    let (endpoint, transport) = plant_transport.resolve(mode);

    let mut seed_result = None;
    if mode == TransportMode::Local {
        let seed_soc_pu = 0.5;
        seed_result = Some(request_local_emulator_soc_seed(shared, plant_id, seed_soc_pu, "startup_fallback", SOC_SEED_TIMEOUT_S).await);
    }

    if let Err(err) = modbus::write_point(transport, endpoint, "enable", 1.0).await {
        warn!(plant = %plant_id, error = %err, "control engine: plant start failed while enabling plant");
        *shared.plant(plant_id).transition.write() = TransitionState::Stopped;
        return Err(("enable_failed".to_string(), Some(json!({"enable_ok": false}))));
    }

    let dispatch_enabled = *shared.plant(plant_id).scheduler_running.read();
    let (p_kw, q_kvar) = latest_schedule_setpoint(shared, plant_id);
    let mut send_ok = false;
    if dispatch_enabled {
        send_ok = modbus::write_point(transport, endpoint, "p_setpoint", p_kw).await.is_ok()
            && modbus::write_point(transport, endpoint, "q_setpoint", q_kvar).await.is_ok();
        if send_ok {
            info!(plant = %plant_id, p_kw, q_kvar, "control engine: initial setpoints sent");
        } else {
            warn!(plant = %plant_id, p_kw, q_kvar, "control engine: initial setpoint write failed");
        }
    } else {
        info!(plant = %plant_id, "control engine: initial setpoint write skipped, dispatch paused");
    }

    *shared.plant(plant_id).transition.write() = TransitionState::Running;

    Ok((
        None,
        Some(json!({
            "enable_ok": true,
            "initial_setpoint_write_ok": send_ok,
            "initial_p_kw": p_kw,
            "initial_q_kvar": q_kvar,
            "dispatch_enabled": dispatch_enabled,
            "seed_result": seed_result.map(|r| format!("{:?}", r.status)),
        })),
    ))
}

async fn stop_one_plant(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>, plant_id: PlantId) -> HandlerResult {
    {
        let mut transition = shared.plant(plant_id).transition.write();
        if matches!(*transition, TransitionState::Stopping | TransitionState::Stopped) {
            return Err(("already_stopped".to_string(), Some(json!({"transition_state": format!("{:?}", *transition)}))));
        }
        *transition = TransitionState::Stopping;
    }

    let disable_ok = safe_stop_plant(shared, transports, plant_id).await;
    if disable_ok {
        *shared.plant(plant_id).transition.write() = TransitionState::Stopped;
        Ok((None, Some(json!({"disable_ok": true}))))
    } else {
        *shared.plant(plant_id).transition.write() = TransitionState::Unknown;
        Err(("disable_failed".to_string(), Some(json!({"disable_ok": false}))))
    }
}

/// Safe-stop sub-protocol: zero setpoints, wait until `|P_battery| <
/// threshold` or timeout, then write `enable=0`.
async fn safe_stop_plant(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>, plant_id: PlantId) -> bool {
    let Some(plant_transport) = transports.get(&plant_id) else { return false };
    let mode = *shared.transport_mode.read();
    let (endpoint, transport) = plant_transport.resolve(mode);

    if modbus::write_point(transport, endpoint, "p_setpoint", 0.0).await.is_err()
        || modbus::write_point(transport, endpoint, "q_setpoint", 0.0).await.is_err()
    {
        warn!(plant = %plant_id, "control engine: safe-stop zero-setpoint write failed");
    }

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs_f64(SAFE_STOP_TIMEOUT_S);
    loop {
        match modbus::read_point(transport, endpoint, "p_battery").await {
            Ok(p) if p.abs() < SAFE_STOP_THRESHOLD_KW => break,
            Ok(_) => {}
            Err(err) => {
                warn!(plant = %plant_id, error = %err, "control engine: safe-stop power read failed");
                return false;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(plant = %plant_id, "control engine: safe-stop timed out waiting for battery power to settle");
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(200)).await;
    }

    modbus::write_point(transport, endpoint, "enable", 0.0).await.is_ok()
}

async fn fleet_start_all(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>) -> HandlerResult {
    for plant_id in PlantId::ALL {
        *shared.plant(plant_id).recording_enabled.write() = true;
    }

    let mut per_plant = serde_json::Map::new();
    let mut any_failed = false;
    for plant_id in PlantId::ALL {
        *shared.plant(plant_id).scheduler_running.write() = true;
        match start_one_plant(shared, transports, plant_id).await {
            Ok((_, result)) => {
                per_plant.insert(plant_id.as_str().to_string(), result.unwrap_or(json!({})));
            }
            Err((message, result)) => {
                if message != "already_running" {
                    any_failed = true;
                }
                per_plant.insert(plant_id.as_str().to_string(), result.unwrap_or(json!({"message": message})));
            }
        }
    }

    if any_failed {
        Err(("fleet_start_partial_failure".to_string(), Some(json!({"per_plant": per_plant}))))
    } else {
        Ok((None, Some(json!({"per_plant": per_plant}))))
    }
}

async fn fleet_stop_all(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>) -> HandlerResult {
    let mut per_plant = serde_json::Map::new();
    let mut all_ok = true;
    for plant_id in PlantId::ALL {
        let ok = safe_stop_plant(shared, transports, plant_id).await;
        *shared.plant(plant_id).transition.write() = if ok { TransitionState::Stopped } else { TransitionState::Unknown };
        all_ok &= ok;
        per_plant.insert(plant_id.as_str().to_string(), json!({"disable_ok": ok}));
    }
    for plant_id in PlantId::ALL {
        *shared.plant(plant_id).scheduler_running.write() = false;
        *shared.plant(plant_id).recording_enabled.write() = false;
    }

    if all_ok {
        Ok((None, Some(json!({"per_plant": per_plant}))))
    } else {
        Err(("fleet_stop_partial_failure".to_string(), Some(json!({"per_plant": per_plant}))))
    }
}

async fn transport_switch(shared: &SharedState, transports: &HashMap<PlantId, PlantTransport>, payload: &serde_json::Value) -> HandlerResult {
    let requested = match payload.get("mode").and_then(|v| v.as_str()) {
        Some("remote") => TransportMode::Remote,
        _ => TransportMode::Local,
    };
    let current = *shared.transport_mode.read();
    if requested == current {
        return Ok((None, Some(json!({"noop": true, "requested_mode": requested.as_str()}))));
    }

    for plant_id in PlantId::ALL {
        safe_stop_plant(shared, transports, plant_id).await;
    }
    *shared.transport_mode.write() = requested;

    Ok((
        None,
        Some(json!({"noop": false, "requested_mode": requested.as_str(), "transport_mode": requested.as_str()})),
    ))
}

async fn request_local_emulator_soc_seed(
    shared: &SharedState,
    plant_id: PlantId,
    soc_pu: f64,
    source: &str,
    timeout_s: f64,
) -> crate::state::SocSeedResult {
    *shared.plant(plant_id).local_emulator_soc_seed_request.write() = Some(soc_pu.clamp(0.0, 1.0));
    info!(plant = %plant_id, soc_pu, source, "control engine: local emulator SoC seed request published");

    let deadline = tokio::time::Instant::now() + StdDuration::from_secs_f64(timeout_s.max(0.1));
    loop {
        let result = shared.plant(plant_id).local_emulator_soc_seed_result.read().clone();
        if result.status != crate::state::SocSeedStatus::Idle {
            return result;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(plant = %plant_id, "control engine: local emulator SoC seed request timed out, continuing start");
            return crate::state::SocSeedResult { status: crate::state::SocSeedStatus::Idle, soc_pu: None, message: Some("timed_out".to_string()) };
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }
}

fn latest_schedule_setpoint(shared: &SharedState, plant_id: PlantId) -> (f64, f64) {
    let plant = shared.plant(plant_id);
    let source = *shared.active_schedule_source.read();
    let api_frame = plant.api_schedule.read().clone();
    let p_key = crate::domain::ManualSeriesKey::for_plant(plant_id, crate::domain::schedule::Signal::P);
    let q_key = crate::domain::ManualSeriesKey::for_plant(plant_id, crate::domain::schedule::Signal::Q);
    let manual_p = shared.manual_series.series[&p_key].read().clone();
    let manual_q = shared.manual_series.series[&q_key].read().clone();
    let manual_p_enabled = shared.manual_series.is_enabled(p_key);
    let manual_q_enabled = shared.manual_series.is_enabled(q_key);

    let effective = if source == ScheduleSource::Api {
        crate::domain::build_effective_schedule(&api_frame, &manual_p, manual_p_enabled, &manual_q, manual_q_enabled)
    } else {
        crate::domain::build_effective_schedule(&crate::domain::ScheduleFrame::new(), &manual_p, manual_p_enabled, &manual_q, manual_q_enabled)
    };

    let now = time_utils::now_in_tz(chrono_tz::UTC);
    let (p_kw, q_kvar, _stale) = crate::domain::schedule::resolve_schedule_setpoint(
        &effective,
        now,
        false,
        crate::domain::schedule::API_STALE_WINDOW,
    );
    (p_kw, q_kvar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PlantModel;

    fn model() -> PlantModel {
        PlantModel { capacity_kwh: 100.0, p_max_kw: 50.0, p_min_kw: -50.0, q_max_kvar: 20.0, q_min_kvar: -20.0, poi_voltage_kv: 11.0 }
    }

    fn shared() -> Arc<SharedState> {
        let mut models = HashMap::new();
        models.insert(PlantId::Lib, model());
        models.insert(PlantId::Vrfb, model());
        SharedState::new(models, "manual", "local", Utc::now())
    }

    #[tokio::test]
    async fn starting_an_already_running_plant_is_rejected() {
        let shared = shared();
        *shared.plant(PlantId::Lib).transition.write() = TransitionState::Running;
        let transports = HashMap::new();
        let result = start_one_plant(&shared, &transports, PlantId::Lib).await;
        assert_eq!(result.unwrap_err().0, "already_running");
    }

    #[tokio::test]
    async fn stopping_an_already_stopped_plant_is_rejected() {
        let shared = shared();
        let transports = HashMap::new();
        let result = stop_one_plant(&shared, &transports, PlantId::Lib).await;
        assert_eq!(result.unwrap_err().0, "already_stopped");
    }

    #[tokio::test]
    async fn transport_switch_is_noop_when_mode_already_matches() {
        let shared = shared();
        let transports = HashMap::new();
        let (message, result) = transport_switch(&shared, &transports, &json!({"mode": "local"})).await.unwrap();
        assert!(message.is_none());
        assert_eq!(result.unwrap()["noop"], json!(true));
    }

    fn local_point_map() -> HashMap<String, crate::domain::PointSpec> {
        use crate::domain::{PointAccess, RegisterFormat};
        let mut points = HashMap::new();
        points.insert("p_setpoint".to_string(), crate::domain::PointSpec { address: 0, format: RegisterFormat::Int32, access: PointAccess::Rw, unit: "kW".to_string(), eng_per_count: 0.1 });
        points.insert("p_battery".to_string(), crate::domain::PointSpec { address: 2, format: RegisterFormat::Int32, access: PointAccess::R, unit: "kW".to_string(), eng_per_count: 0.1 });
        points.insert("q_setpoint".to_string(), crate::domain::PointSpec { address: 4, format: RegisterFormat::Int32, access: PointAccess::Rw, unit: "kvar".to_string(), eng_per_count: 0.1 });
        points.insert("q_battery".to_string(), crate::domain::PointSpec { address: 6, format: RegisterFormat::Int32, access: PointAccess::R, unit: "kvar".to_string(), eng_per_count: 0.1 });
        points.insert("enable".to_string(), crate::domain::PointSpec { address: 8, format: RegisterFormat::Uint16, access: PointAccess::Rw, unit: String::new(), eng_per_count: 1.0 });
        points
    }

    fn local_plant_transport(bank: Arc<crate::modbus::RegisterBank>) -> PlantTransport {
        let endpoint = ModbusEndpoint {
            host: "localhost".to_string(),
            port: 5020,
            byte_order: crate::domain::ByteOrder::Big,
            word_order: crate::domain::WordOrder::MswFirst,
            points: local_point_map(),
        };
        let transport: Arc<dyn crate::modbus::ModbusTransport> = Arc::new(crate::modbus::LocalTransport::new(bank));
        PlantTransport { local: (endpoint, transport), remote: None }
    }

    #[tokio::test]
    async fn safe_stop_waits_for_battery_power_to_settle_before_disabling() {
        let shared = shared();
        let bank = crate::modbus::RegisterBank::new();
        let plant_transport = local_plant_transport(bank.clone());
        let mut transports: HashMap<PlantId, PlantTransport> = HashMap::new();
        transports.insert(PlantId::Lib, plant_transport);

        let (endpoint, transport) = transports[&PlantId::Lib].resolve(TransportMode::Local);
        modbus::write_point(transport, endpoint, "enable", 1.0).await.unwrap();
        modbus::write_point(transport, endpoint, "p_battery", 40.0).await.unwrap();

        let ramp_bank = bank.clone();
        let ramp_endpoint = local_plant_transport(ramp_bank.clone()).local.0;
        let ramp = tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(300)).await;
            let transport = crate::modbus::LocalTransport::new(ramp_bank);
            modbus::write_point(&transport, &ramp_endpoint, "p_battery", 0.2).await.unwrap();
        });

        let disabled = safe_stop_plant(&shared, &transports, PlantId::Lib).await;
        ramp.await.unwrap();

        assert!(disabled);
        let (endpoint, transport) = transports[&PlantId::Lib].resolve(TransportMode::Local);
        let enable = modbus::read_point(transport, endpoint, "enable").await.unwrap();
        assert_eq!(enable as u16, 0);
        let p_setpoint = modbus::read_point(transport, endpoint, "p_setpoint").await.unwrap();
        assert!((p_setpoint - 0.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn dispatch_enable_toggles_the_gate() {
        let shared = shared();
        let (_, result) = execute_command(&shared, &HashMap::new(), &crate::domain::Command {
            id: "cmd-000001".to_string(),
            kind: "plant.dispatch_enable".to_string(),
            payload: json!({"plant_id": "lib"}),
            source: "test".to_string(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            state: CommandState::Queued,
            message: None,
            result: None,
        })
        .await
        .unwrap();
        assert_eq!(result.unwrap()["current"], json!(true));
        assert!(*shared.plant(PlantId::Lib).scheduler_running.read());
    }
}
