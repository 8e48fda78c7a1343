//! Plant Emulator: a Modbus/TCP-shaped in-process simulation of one battery
//! plant — SoC integration with power limiting, reactive-power clamping,
//! and a POI impedance power model.
//!
//! Grounded in the original source's `plant_agent.py`. The SoC-limiting
//! arithmetic (`future_soc_kwh` prediction, `p_lim_kw` clamp formulas) and
//! the POI impedance model are carried over exactly; register I/O is
//! reshaped onto `domain::modbus_point` + `modbus::RegisterBank` the way the
//! teacher's `domain::battery::SimulatedBattery` owns its own state and is
//! driven by a periodic tick rather than transliterating the Python loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{debug, info, warn};

use crate::domain::modbus_point::{ByteOrder, WordOrder};
use crate::domain::{PlantModel, TransportMode};
use crate::modbus::{self, LocalTransport, ModbusEndpoint, ModbusTransport, RegisterBank};
use crate::state::{SharedState, SocSeedResult, SocSeedStatus};
use crate::domain::PlantId;

/// Power factor, impedance, and nominal voltage used by the POI model.
/// These are illustrative plant characteristics, not derived from
/// `PlantModel`'s nameplate limits, and are not exposed as configuration —
/// matching the original source's fixed `PLANT_R_OHM`/`PLANT_X_OHM`/
/// `PLANT_POWER_FACTOR` constants.
#[derive(Debug, Clone, Copy)]
pub struct PoiModelParams {
    pub r_ohm: f64,
    pub x_ohm: f64,
    pub power_factor: f64,
}

impl Default for PoiModelParams {
    fn default() -> Self {
        Self {
            r_ohm: 0.01,
            x_ohm: 0.05,
            power_factor: 0.98,
        }
    }
}

/// Minimal (re, im) pair — just enough complex arithmetic for the POI model
/// below, not a general-purpose numeric type.
#[derive(Debug, Clone, Copy)]
struct Cplx {
    re: f64,
    im: f64,
}

impl Cplx {
    fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    fn from_polar(r: f64, theta: f64) -> Self {
        Self::new(r * theta.cos(), r * theta.sin())
    }

    fn conj(self) -> Self {
        Self::new(self.re, -self.im)
    }

    fn norm(self) -> f64 {
        (self.re * self.re + self.im * self.im).sqrt()
    }
}

impl std::ops::Mul for Cplx {
    type Output = Cplx;
    fn mul(self, rhs: Cplx) -> Cplx {
        Cplx::new(self.re * rhs.re - self.im * rhs.im, self.re * rhs.im + self.im * rhs.re)
    }
}

impl std::ops::Mul<f64> for Cplx {
    type Output = Cplx;
    fn mul(self, rhs: f64) -> Cplx {
        Cplx::new(self.re * rhs, self.im * rhs)
    }
}

impl std::ops::Div<f64> for Cplx {
    type Output = Cplx;
    fn div(self, rhs: f64) -> Cplx {
        Cplx::new(self.re / rhs, self.im / rhs)
    }
}

impl std::ops::Sub for Cplx {
    type Output = Cplx;
    fn sub(self, rhs: Cplx) -> Cplx {
        Cplx::new(self.re - rhs.re, self.im - rhs.im)
    }
}

/// Three-phase POI power model via series R+jX impedance. Returns
/// `(p_poi_kw, q_poi_kvar, v_poi_pu)`.
pub fn calculate_poi_power(p_batt_kw: f64, v_nom_v: f64, params: PoiModelParams) -> (f64, f64, f64) {
    if p_batt_kw.abs() < 0.01 {
        return (0.0, 0.0, 1.0);
    }

    let s_batt_kva = p_batt_kw.abs() / params.power_factor;

    let v_nom_ll_kv = v_nom_v / 1000.0;
    let v_nom_ph_kv = v_nom_ll_kv / 3.0_f64.sqrt();

    let s_batt_per_phase_kva = s_batt_kva / 3.0;
    let i_ka = s_batt_per_phase_kva / v_nom_ph_kv;

    let mut phi = params.power_factor.acos();
    if p_batt_kw < 0.0 {
        phi = -phi;
    }

    let i_complex = Cplx::from_polar(i_ka, -phi);
    let z_ohm = Cplx::new(params.r_ohm, params.x_ohm);
    let v_drop_kv = (i_complex * z_ohm) / 1000.0;

    let v_poi_kv = Cplx::new(v_nom_ph_kv, 0.0) - v_drop_kv;
    let v_poi_pu = v_poi_kv.norm() / v_nom_ph_kv;

    let s_poi_per_phase_kva = v_poi_kv * i_complex.conj();
    let s_poi_kva = s_poi_per_phase_kva * 3.0;

    (s_poi_kva.re, s_poi_kva.im, v_poi_pu)
}

/// Mutable simulated-battery state for one plant, owned entirely by the
/// emulator task.
pub struct PlantEmulatorState {
    pub soc_kwh: f64,
    was_limited_previously: bool,
    previous_limited_power_kw: Option<f64>,
}

impl PlantEmulatorState {
    pub fn new(initial_soc_pu: f64, capacity_kwh: f64) -> Self {
        Self {
            soc_kwh: initial_soc_pu.clamp(0.0, 1.0) * capacity_kwh,
            was_limited_previously: false,
            previous_limited_power_kw: None,
        }
    }

    /// Run one emulator period: apply SoC-limited active power, clamp
    /// reactive power, integrate SoC, and return `(p_actual_kw, q_actual_kvar)`.
    fn step(
        &mut self,
        plant_id: PlantId,
        p_req_kw: f64,
        q_req_kvar: f64,
        model: &PlantModel,
        dt_h: f64,
    ) -> (f64, f64) {
        let future_soc_kwh = self.soc_kwh - p_req_kw * dt_h;
        let mut actual_p_kw = p_req_kw;
        let mut is_limited_now = false;
        let mut limit_reason = "";

        if future_soc_kwh > model.capacity_kwh {
            is_limited_now = true;
            limit_reason = "SoC would exceed capacity";
            let p_lim_kw = (self.soc_kwh - model.capacity_kwh) / dt_h;
            actual_p_kw = p_req_kw.max(p_lim_kw);
        } else if future_soc_kwh < 0.0 {
            is_limited_now = true;
            limit_reason = "SoC would fall below zero";
            let p_lim_kw = self.soc_kwh / dt_h;
            actual_p_kw = p_req_kw.min(p_lim_kw);
        }

        if is_limited_now {
            let changed = self
                .previous_limited_power_kw
                .map(|prev| (actual_p_kw - prev).abs() > 0.01)
                .unwrap_or(true);
            if !self.was_limited_previously || changed {
                warn!(plant = %plant_id, reason = limit_reason, from_kw = p_req_kw, to_kw = actual_p_kw, "active power limited");
            }
            self.previous_limited_power_kw = Some(actual_p_kw);
        } else if self.was_limited_previously {
            info!(plant = %plant_id, "active power limitation removed");
            self.previous_limited_power_kw = None;
        }
        self.was_limited_previously = is_limited_now;

        self.soc_kwh = (self.soc_kwh - actual_p_kw * dt_h).clamp(0.0, model.capacity_kwh);

        let mut actual_q_kvar = q_req_kvar;
        if actual_q_kvar > model.q_max_kvar {
            warn!(plant = %plant_id, limit = model.q_max_kvar, "reactive power limited (max)");
            actual_q_kvar = model.q_max_kvar;
        } else if actual_q_kvar < model.q_min_kvar {
            warn!(plant = %plant_id, limit = model.q_min_kvar, "reactive power limited (min)");
            actual_q_kvar = model.q_min_kvar;
        }

        (actual_p_kw, actual_q_kvar)
    }

    pub fn soc_pu(&self, capacity_kwh: f64) -> f64 {
        if capacity_kwh <= 0.0 {
            0.0
        } else {
            self.soc_kwh / capacity_kwh
        }
    }
}

fn local_point_map(base_address: u16) -> std::collections::HashMap<crate::domain::PointName, crate::domain::PointSpec> {
    use crate::domain::{PointAccess, PointSpec, RegisterFormat};
    let mut points = std::collections::HashMap::new();
    let mut addr = base_address;
    let mut add = |points: &mut std::collections::HashMap<String, PointSpec>,
                   name: &str,
                   format: RegisterFormat,
                   access: PointAccess,
                   eng_per_count: f64| {
        points.insert(
            name.to_string(),
            PointSpec {
                address: addr,
                format,
                access,
                unit: String::new(),
                eng_per_count,
            },
        );
        addr += format.word_count();
    };
    add(&mut points, "p_setpoint", RegisterFormat::Int32, PointAccess::Rw, 0.1);
    add(&mut points, "p_battery", RegisterFormat::Int32, PointAccess::R, 0.1);
    add(&mut points, "q_setpoint", RegisterFormat::Int32, PointAccess::Rw, 0.1);
    add(&mut points, "q_battery", RegisterFormat::Int32, PointAccess::R, 0.1);
    add(&mut points, "enable", RegisterFormat::Uint16, PointAccess::Rw, 1.0);
    add(&mut points, "soc", RegisterFormat::Uint16, PointAccess::R, 0.0001);
    add(&mut points, "p_poi", RegisterFormat::Int32, PointAccess::R, 0.1);
    add(&mut points, "q_poi", RegisterFormat::Int32, PointAccess::R, 0.1);
    add(&mut points, "v_poi", RegisterFormat::Uint16, PointAccess::R, 0.01);
    points
}

/// Build the local-mode endpoint for a plant's emulated register bank.
pub fn local_endpoint() -> ModbusEndpoint {
    ModbusEndpoint {
        host: "localhost".to_string(),
        port: 0,
        byte_order: ByteOrder::Big,
        word_order: WordOrder::MswFirst,
        points: local_point_map(0),
    }
}

/// Run the Plant Emulator loop for one plant until shutdown is signaled.
pub async fn run(
    plant_id: PlantId,
    shared: Arc<SharedState>,
    bank: Arc<RegisterBank>,
    endpoint: ModbusEndpoint,
    initial_soc_pu: f64,
    period: StdDuration,
) {
    let transport = LocalTransport::new(bank);
    let model = shared.plant(plant_id).model;
    let mut state = PlantEmulatorState::new(initial_soc_pu, model.capacity_kwh);
    let poi_params = PoiModelParams::default();
    let dt_h = period.as_secs_f64() / 3600.0;

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!(plant = %plant_id, "plant emulator stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        if *shared.transport_mode.read() != TransportMode::Local {
            // Remote mode: the real controller owns the physics, the local
            // register bank would just drift out of sync with it.
            continue;
        }

        if let Err(err) = run_once(plant_id, &shared, &transport, &endpoint, &mut state, &model, poi_params, dt_h).await {
            warn!(plant = %plant_id, error = %err, "plant emulator tick failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_once(
    plant_id: PlantId,
    shared: &SharedState,
    transport: &dyn ModbusTransport,
    endpoint: &ModbusEndpoint,
    state: &mut PlantEmulatorState,
    model: &PlantModel,
    poi_params: PoiModelParams,
    dt_h: f64,
) -> anyhow::Result<()> {
    let p_setpoint = modbus::read_point(transport, endpoint, "p_setpoint").await?;
    let q_setpoint = modbus::read_point(transport, endpoint, "q_setpoint").await?;
    let enable = modbus::read_point(transport, endpoint, "enable").await?;
    let is_enabled = enable != 0.0;

    let (p_req, q_req) = if is_enabled { (p_setpoint, q_setpoint) } else { (0.0, 0.0) };

    maybe_apply_soc_seed(plant_id, shared, state, model, is_enabled);

    let (p_actual, q_actual) = state.step(plant_id, p_req, q_req, model, dt_h);
    let (p_poi, q_poi, v_poi) = calculate_poi_power(p_actual, model.poi_voltage_kv * 1000.0, poi_params);
    let soc_pu = state.soc_pu(model.capacity_kwh);

    modbus::write_point(transport, endpoint, "p_battery", p_actual).await?;
    modbus::write_point(transport, endpoint, "q_battery", q_actual).await?;
    modbus::write_point(transport, endpoint, "soc", soc_pu).await?;
    modbus::write_point(transport, endpoint, "p_poi", p_poi).await?;
    modbus::write_point(transport, endpoint, "q_poi", q_poi).await?;
    modbus::write_point(transport, endpoint, "v_poi", v_poi).await?;

    debug!(
        plant = %plant_id,
        p_setpoint, p_actual, q_setpoint, q_actual, soc_pu, p_poi, q_poi, v_poi,
        "plant emulator tick"
    );

    Ok(())
}

fn maybe_apply_soc_seed(
    plant_id: PlantId,
    shared: &SharedState,
    state: &mut PlantEmulatorState,
    model: &PlantModel,
    is_enabled: bool,
) {
    let plant = shared.plant(plant_id);
    let requested = { plant.local_emulator_soc_seed_request.write().take() };
    let Some(requested) = requested else { return };

    let mut result = plant.local_emulator_soc_seed_result.write();
    if is_enabled {
        *result = SocSeedResult {
            status: SocSeedStatus::Skipped,
            soc_pu: None,
            message: Some("plant is enabled".to_string()),
        };
        warn!(plant = %plant_id, "SoC seed request skipped: plant is enabled");
        return;
    }

    let soc_pu = requested.clamp(0.0, 1.0);
    state.soc_kwh = soc_pu * model.capacity_kwh;
    *result = SocSeedResult {
        status: SocSeedStatus::Applied,
        soc_pu: Some(soc_pu),
        message: None,
    };
    info!(plant = %plant_id, soc_pu, "SoC seed applied");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PlantModel {
        PlantModel {
            capacity_kwh: 100.0,
            p_max_kw: 50.0,
            p_min_kw: -50.0,
            q_max_kvar: 20.0,
            q_min_kvar: -20.0,
            poi_voltage_kv: 11.0,
        }
    }

    #[test]
    fn discharge_clamped_when_soc_would_go_negative() {
        let mut state = PlantEmulatorState::new(0.0, 100.0);
        let (p_actual, _) = state.step(PlantId::Lib, 50.0, 0.0, &model(), 1.0);
        assert!((p_actual - 0.0).abs() < 1e-9);
    }

    #[test]
    fn charge_clamped_when_soc_would_exceed_capacity() {
        let mut state = PlantEmulatorState::new(1.0, 100.0);
        let (p_actual, _) = state.step(PlantId::Lib, -50.0, 0.0, &model(), 1.0);
        assert!((p_actual - 0.0).abs() < 1e-9);
    }

    #[test]
    fn unconstrained_power_passes_through() {
        let mut state = PlantEmulatorState::new(0.5, 100.0);
        let (p_actual, q_actual) = state.step(PlantId::Lib, 10.0, 5.0, &model(), 1.0);
        assert!((p_actual - 10.0).abs() < 1e-9);
        assert!((q_actual - 5.0).abs() < 1e-9);
    }

    #[test]
    fn reactive_power_clamps_to_limits() {
        let mut state = PlantEmulatorState::new(0.5, 100.0);
        let (_, q_actual) = state.step(PlantId::Lib, 0.0, 100.0, &model(), 1.0);
        assert_eq!(q_actual, 20.0);
    }

    #[test]
    fn zero_power_poi_model_has_unity_voltage_and_no_flow() {
        let (p, q, v) = calculate_poi_power(0.0, 11_000.0, PoiModelParams::default());
        assert_eq!(p, 0.0);
        assert_eq!(q, 0.0);
        assert_eq!(v, 1.0);
    }

    #[test]
    fn nonzero_power_poi_model_reports_voltage_drop() {
        let (p, _q, v) = calculate_poi_power(40.0, 11_000.0, PoiModelParams::default());
        assert!(p > 0.0);
        assert!(v < 1.0);
    }
}
