//! Settings Engine (§4.7): single-consumer drainer of the settings command
//! queue (manual override activation, API connect/disconnect, posting
//! policy toggles).
//!
//! Grounded in the original source's `settings_engine_agent.py`: the
//! `inactive/activating/active/inactivating/updating/error` transition
//! guard around manual series commands, and the connect/disconnect/posting
//! command shapes against `istentore_api.IstentoreAPI`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use chrono_tz::Tz;
use serde_json::json;
use tracing::{info, warn};

use crate::api_client::ApiClient;
use crate::domain::{CommandState, ManualSeries, ManualSeriesKey};
use crate::state::{ManualSeriesTransition, SharedState};

pub fn default_loop_period() -> StdDuration {
    StdDuration::from_millis(200)
}

pub async fn run(shared: Arc<SharedState>, api: Arc<ApiClient>, tz: Tz, period: StdDuration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("settings engine stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        run_single_cycle(&shared, &api, tz).await;
    }
}

async fn run_single_cycle(shared: &SharedState, api: &ApiClient, tz: Tz) {
    let command = { shared.settings_commands.write().try_dequeue() };
    let Some(command) = command else { return };

    let started_at = Utc::now();
    {
        let mut queue = shared.settings_commands.write();
        queue.mark_running(&command.id, started_at);
    }

    let (state, message, result) = match execute_command(shared, api, tz, &command).await {
        Ok((message, result)) => (CommandState::Succeeded, message, result),
        Err((message, result)) => (state_for_rejection(&message), Some(message), result),
    };

    let finished_at = Utc::now();
    let mut queue = shared.settings_commands.write();
    let finished = queue.mark_finished(&command.id, state, message.as_deref(), result, finished_at);
    drop(queue);
    info!(command = %finished.id, kind = %finished.kind, state = ?finished.state, "settings engine command finished");
}

/// The original source treats precondition failures (`already_transitioning`,
/// `missing_password`, `not_active`, `invalid_series_key`, `invalid_payload`)
/// as `rejected`, and handler-reached-but-failed outcomes (`connect_failed`)
/// as `failed`. Everything else recognized here is a precondition.
fn state_for_rejection(message: &str) -> CommandState {
    match message {
        "connect_failed" | "unsupported_command" => CommandState::Failed,
        _ => CommandState::Rejected,
    }
}

type HandlerResult = Result<(Option<String>, Option<serde_json::Value>), (String, Option<serde_json::Value>)>;

async fn execute_command(shared: &SharedState, api: &ApiClient, tz: Tz, command: &crate::domain::Command) -> HandlerResult {
    match command.kind.as_str() {
        "manual.activate" => apply_manual_series_command(shared, tz, command, false).await,
        "manual.update" => apply_manual_series_command(shared, tz, command, true).await,
        "manual.inactivate" => apply_manual_inactivate(shared, command).await,
        "api.connect" => apply_api_connect(shared, api, command).await,
        "api.disconnect" => apply_api_disconnect(shared).await,
        "posting.enable" => apply_posting_policy(shared, true).await,
        "posting.disable" => apply_posting_policy(shared, false).await,
        other => Err(("unsupported_command".to_string(), Some(json!({"kind": other})))),
    }
}

fn parse_series_key(payload: &serde_json::Value) -> Option<ManualSeriesKey> {
    match payload.get("series_key").and_then(|v| v.as_str()) {
        Some("lib_p") => Some(ManualSeriesKey::LibP),
        Some("lib_q") => Some(ManualSeriesKey::LibQ),
        Some("vrfb_p") => Some(ManualSeriesKey::VrfbP),
        Some("vrfb_q") => Some(ManualSeriesKey::VrfbQ),
        _ => None,
    }
}

async fn apply_manual_series_command(shared: &SharedState, tz: Tz, command: &crate::domain::Command, is_update: bool) -> HandlerResult {
    let Some(series_key) = parse_series_key(&command.payload) else {
        return Err(("invalid_series_key".to_string(), Some(json!({"series_key": command.payload.get("series_key")}))));
    };

    {
        let transition = *shared.manual_series.transition[&series_key].read();
        if matches!(transition, ManualSeriesTransition::Activating | ManualSeriesTransition::Inactivating | ManualSeriesTransition::Updating) {
            return Err(("already_transitioning".to_string(), Some(json!({"series_key": series_key.as_str()}))));
        }
        if is_update && !shared.manual_series.is_enabled(series_key) {
            return Err(("not_active".to_string(), Some(json!({"series_key": series_key.as_str()}))));
        }
    }

    let series = match parse_series_rows(command.payload.get("series_rows"), tz) {
        Ok(series) => series,
        Err(err) => {
            *shared.manual_series.transition.get(&series_key).unwrap().write() = ManualSeriesTransition::Error;
            return Err(("invalid_payload".to_string(), Some(json!({"series_key": series_key.as_str(), "error": err}))));
        }
    };
    if let Err(err) = series.validate_offsets() {
        *shared.manual_series.transition.get(&series_key).unwrap().write() = ManualSeriesTransition::Error;
        return Err(("invalid_payload".to_string(), Some(json!({"series_key": series_key.as_str(), "error": err}))));
    }

    *shared.manual_series.transition.get(&series_key).unwrap().write() =
        if is_update { ManualSeriesTransition::Updating } else { ManualSeriesTransition::Activating };

    let row_count = series.len();
    *shared.manual_series.series.get(&series_key).unwrap().write() = series;
    *shared.manual_series.merge_enabled.get(&series_key).unwrap().write() = true;
    *shared.manual_series.transition.get(&series_key).unwrap().write() = ManualSeriesTransition::Active;

    Ok((None, Some(json!({"series_key": series_key.as_str(), "active": true, "row_count": row_count}))))
}

async fn apply_manual_inactivate(shared: &SharedState, command: &crate::domain::Command) -> HandlerResult {
    let Some(series_key) = parse_series_key(&command.payload) else {
        return Err(("invalid_series_key".to_string(), Some(json!({"series_key": command.payload.get("series_key")}))));
    };

    {
        let transition = *shared.manual_series.transition[&series_key].read();
        if matches!(transition, ManualSeriesTransition::Activating | ManualSeriesTransition::Inactivating | ManualSeriesTransition::Updating) {
            return Err(("already_transitioning".to_string(), Some(json!({"series_key": series_key.as_str()}))));
        }
    }

    *shared.manual_series.transition.get(&series_key).unwrap().write() = ManualSeriesTransition::Inactivating;
    *shared.manual_series.merge_enabled.get(&series_key).unwrap().write() = false;
    *shared.manual_series.transition.get(&series_key).unwrap().write() = ManualSeriesTransition::Inactive;

    Ok((None, Some(json!({"series_key": series_key.as_str(), "active": false}))))
}

fn parse_series_rows(rows: Option<&serde_json::Value>, tz: Tz) -> Result<ManualSeries, String> {
    let Some(rows) = rows.and_then(|v| v.as_array()) else {
        return Ok(ManualSeries::new());
    };
    let mut parsed = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let datetime = row
            .get("datetime")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("row {i}: missing datetime"))?;
        let setpoint = row
            .get("setpoint")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| format!("row {i}: missing or non-numeric setpoint"))?;
        let parsed_dt = chrono::DateTime::parse_from_rfc3339(datetime)
            .map_err(|e| format!("row {i}: invalid datetime: {e}"))?
            .with_timezone(&tz);
        parsed.push((parsed_dt, setpoint));
    }
    Ok(ManualSeries::from_rows(parsed))
}

async fn apply_api_connect(shared: &SharedState, api: &ApiClient, command: &crate::domain::Command) -> HandlerResult {
    if let Some(password) = command.payload.get("password").and_then(|v| v.as_str()) {
        if !password.trim().is_empty() {
            api.set_password(password.to_string());
        }
    }

    if !api.has_credentials() {
        return Err(("missing_password".to_string(), None));
    }

    match api.login().await {
        Ok(()) => {
            *shared.api_connected.write() = true;
            Ok((None, Some(json!({"connected": true}))))
        }
        Err(err) => {
            warn!(error = %err, "settings engine: api.connect login failed");
            *shared.api_connected.write() = false;
            Err(("connect_failed".to_string(), Some(json!({"error": err.to_string()}))))
        }
    }
}

async fn apply_api_disconnect(shared: &SharedState) -> HandlerResult {
    *shared.api_connected.write() = false;
    Ok((None, Some(json!({"disconnected": true}))))
}

async fn apply_posting_policy(shared: &SharedState, enabled: bool) -> HandlerResult {
    *shared.measurement_posting_enabled.write() = enabled;
    Ok((None, Some(json!({"policy_enabled": enabled}))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PlantId;
    use crate::domain::PlantModel;
    use std::collections::HashMap;

    fn model() -> PlantModel {
        PlantModel { capacity_kwh: 100.0, p_max_kw: 50.0, p_min_kw: -50.0, q_max_kvar: 20.0, q_min_kvar: -20.0, poi_voltage_kv: 11.0 }
    }

    fn shared() -> Arc<SharedState> {
        let mut models = HashMap::new();
        models.insert(PlantId::Lib, model());
        models.insert(PlantId::Vrfb, model());
        SharedState::new(models, "manual", "local", Utc::now())
    }

    fn command(kind: &str, payload: serde_json::Value) -> crate::domain::Command {
        crate::domain::Command {
            id: "cmd-000001".to_string(),
            kind: kind.to_string(),
            payload,
            source: "test".to_string(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            state: CommandState::Queued,
            message: None,
            result: None,
        }
    }

    #[tokio::test]
    async fn manual_update_on_inactive_series_is_rejected() {
        let shared = shared();
        let cmd = command("manual.update", json!({"series_key": "lib_p", "series_rows": []}));
        let result = apply_manual_series_command(&shared, chrono_tz::UTC, &cmd, true).await;
        assert_eq!(result.unwrap_err().0, "not_active");
    }

    #[tokio::test]
    async fn manual_activate_with_valid_rows_enables_the_merge_flag() {
        let shared = shared();
        let cmd = command(
            "manual.activate",
            json!({"series_key": "lib_p", "series_rows": [{"datetime": "2026-01-01T00:00:00+00:00", "setpoint": 10.0}]}),
        );
        let result = apply_manual_series_command(&shared, chrono_tz::UTC, &cmd, false).await;
        assert!(result.is_ok());
        assert!(shared.manual_series.is_enabled(ManualSeriesKey::LibP));
    }

    #[tokio::test]
    async fn inactivate_clears_merge_flag_without_erasing_series() {
        let shared = shared();
        let activate = command(
            "manual.activate",
            json!({"series_key": "lib_p", "series_rows": [{"datetime": "2026-01-01T00:00:00+00:00", "setpoint": 10.0}]}),
        );
        apply_manual_series_command(&shared, chrono_tz::UTC, &activate, false).await.unwrap();

        let inactivate = command("manual.inactivate", json!({"series_key": "lib_p"}));
        let result = apply_manual_inactivate(&shared, &inactivate).await;
        assert!(result.is_ok());
        assert!(!shared.manual_series.is_enabled(ManualSeriesKey::LibP));
        assert!(!shared.manual_series.series[&ManualSeriesKey::LibP].read().is_empty());
    }

    #[tokio::test]
    async fn posting_policy_toggles_flag() {
        let shared = shared();
        apply_posting_policy(&shared, false).await.unwrap();
        assert!(!*shared.measurement_posting_enabled.read());
        apply_posting_policy(&shared, true).await.unwrap();
        assert!(*shared.measurement_posting_enabled.read());
    }
}
