mod api_client;
mod config;
mod data_fetcher;
mod domain;
mod engine;
mod errors;
mod measurement;
mod modbus;
mod plant_emulator;
mod scheduler;
mod state;
mod telemetry;
mod time_utils;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{NaiveTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use api_client::{ApiClient, ApiClientConfig};
use config::HilConfig;
use domain::{PlantId, PlantModel};
use measurement::sampler::Tolerances;
use modbus::{LocalTransport, ModbusEndpoint, ModbusTransport, PlantTransport, RegisterBank};
use state::SharedState;

fn period(seconds: f64) -> StdDuration {
    StdDuration::from_millis((seconds * 1000.0).max(1.0) as u64)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = HilConfig::load()?;
    let _tracing_guard = telemetry::init_tracing(&cfg.telemetry.log_dir);

    let tz = time_utils::parse_timezone(&cfg.timezone)?;
    let tomorrow_poll_start_time = NaiveTime::parse_from_str(&cfg.api.tomorrow_poll_start_time, "%H:%M")
        .map_err(|e| anyhow::anyhow!("invalid tomorrow_poll_start_time: {e}"))?;

    let mut models: HashMap<PlantId, PlantModel> = HashMap::new();
    models.insert(PlantId::Lib, (&cfg.plants.lib.model).into());
    models.insert(PlantId::Vrfb, (&cfg.plants.vrfb.model).into());

    let shared = SharedState::new(models, &cfg.schedule.startup_schedule_source, &cfg.startup.transport_mode, Utc::now());

    info!(transport_mode = %*shared.transport_mode.read(), "starting HIL dispatch scheduler");

    let banks: HashMap<PlantId, Arc<RegisterBank>> =
        PlantId::ALL.into_iter().map(|id| (id, RegisterBank::new())).collect();

    let mut transports: HashMap<PlantId, PlantTransport> = HashMap::new();
    let mut series_ids = HashMap::new();
    for id in PlantId::ALL {
        let plant_cfg = match id {
            PlantId::Lib => &cfg.plants.lib,
            PlantId::Vrfb => &cfg.plants.vrfb,
        };
        let local_endpoint: ModbusEndpoint = (&plant_cfg.modbus.local).into();
        let bank = banks[&id].clone();
        let local: (ModbusEndpoint, Arc<dyn ModbusTransport>) =
            (local_endpoint, Arc::new(LocalTransport::new(bank)));

        #[cfg(feature = "modbus")]
        let remote = match &plant_cfg.modbus.remote {
            Some(remote_cfg) => {
                let endpoint: ModbusEndpoint = remote_cfg.into();
                match modbus::remote::RemoteTransport::connect(&endpoint.host, endpoint.port, 1).await {
                    Ok(transport) => Some((endpoint, Arc::new(transport) as Arc<dyn ModbusTransport>)),
                    Err(err) => {
                        warn!(plant = %id, error = %err, "failed to connect remote transport, remote mode unavailable for this plant");
                        None
                    }
                }
            }
            None => None,
        };
        #[cfg(not(feature = "modbus"))]
        let remote = None;

        transports.insert(id, PlantTransport { local, remote });
        series_ids.insert(id, crate::domain::measurement::PostSeriesIds::from(&plant_cfg.measurement_series));
    }

    let api = Arc::new(ApiClient::new(ApiClientConfig {
        base_url: cfg.api.base_url.clone(),
        email: cfg.api.email.clone(),
        password: String::new(),
    }));

    let tolerances = Tolerances {
        p_setpoint_kw: cfg.recording.tolerances.p_setpoint_kw,
        battery_active_power_kw: cfg.recording.tolerances.battery_active_power_kw,
        q_setpoint_kvar: cfg.recording.tolerances.q_setpoint_kvar,
        battery_reactive_power_kvar: cfg.recording.tolerances.battery_reactive_power_kvar,
        soc_pu: cfg.recording.tolerances.soc_pu,
        p_poi_kw: cfg.recording.tolerances.p_poi_kw,
        q_poi_kvar: cfg.recording.tolerances.q_poi_kvar,
        v_poi_pu: cfg.recording.tolerances.v_poi_kv,
    };
    let data_dir = PathBuf::from(&cfg.recording.data_dir);

    let (post_tx, post_rx) = mpsc::channel(cfg.api.post.queue_maxlen);

    let mut tasks = Vec::new();

    for id in PlantId::ALL {
        let plant_cfg = match id {
            PlantId::Lib => &cfg.plants.lib,
            PlantId::Vrfb => &cfg.plants.vrfb,
        };
        let bank = banks[&id].clone();
        let endpoint: ModbusEndpoint = (&plant_cfg.modbus.local).into();
        let shared = shared.clone();
        let initial_soc_pu = cfg.startup.initial_soc_pu;
        let plant_period = period(cfg.timing.plant_period_s);
        tasks.push(tokio::spawn(async move {
            plant_emulator::run(id, shared, bank, endpoint, initial_soc_pu, plant_period).await;
        }));
    }

    {
        let shared = shared.clone();
        let transports = transports.clone();
        let scheduler_period = period(cfg.timing.scheduler_period_s);
        tasks.push(tokio::spawn(async move {
            scheduler::run(shared, transports, scheduler_period).await;
        }));
    }

    {
        let shared = shared.clone();
        let transports = transports.clone();
        let measurement_period = period(cfg.timing.measurement_period_s);
        tasks.push(tokio::spawn(async move {
            measurement::sampler::run(shared, transports, series_ids, data_dir, tolerances, post_tx, measurement_period).await;
        }));
    }

    {
        let shared = shared.clone();
        let api = api.clone();
        let post_period = period(cfg.api.post.period_s);
        tasks.push(tokio::spawn(async move {
            measurement::post_worker::run(shared, api, post_rx, post_period).await;
        }));
    }

    {
        let shared = shared.clone();
        let api = api.clone();
        let data_fetcher_period = period(cfg.timing.data_fetcher_period_s);
        tasks.push(tokio::spawn(async move {
            data_fetcher::run(shared, api, tz, tomorrow_poll_start_time, data_fetcher_period).await;
        }));
    }

    {
        let shared = shared.clone();
        let transports = transports.clone();
        let control_engine_period = period(cfg.timing.control_engine_period_s);
        tasks.push(tokio::spawn(async move {
            engine::control_engine::run(shared, transports, control_engine_period).await;
        }));
    }

    {
        let shared = shared.clone();
        let api = api.clone();
        let settings_engine_period = period(cfg.timing.settings_engine_period_s);
        tasks.push(tokio::spawn(async move {
            engine::settings_engine::run(shared, api, tz, settings_engine_period).await;
        }));
    }

    telemetry::shutdown_signal().await;
    info!("shutdown signal received, stopping all tasks");
    shared.shutdown.cancel();

    for task in tasks {
        let _ = task.await;
    }

    warn!("shutdown complete");
    Ok(())
}
