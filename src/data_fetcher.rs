//! Data Fetcher (§4.4): keeps today's/tomorrow's day-ahead schedule current
//! per plant, promoting tomorrow into today on date rollover and gating the
//! tomorrow poll behind a configured local time-of-day.
//!
//! Grounded in the original source's `data_fetcher_agent.py` state machine
//! (today/tomorrow fetched flags, date-rollover promotion, gated tomorrow
//! poll) composed with `api_client::ApiClient::get_day_ahead_schedules`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::api_client::ApiClient;
use crate::domain::{PlantId, ScheduleFrame};
use crate::state::{DataFetcherStatus, SharedState};
use crate::time_utils;

#[derive(Debug, Clone)]
struct FetcherState {
    today_date: NaiveDate,
    tomorrow_date: NaiveDate,
    today_fetched: bool,
    tomorrow_fetched: bool,
    last_attempt: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl FetcherState {
    fn new(today: NaiveDate) -> Self {
        Self {
            today_date: today,
            tomorrow_date: today + chrono::Duration::days(1),
            today_fetched: false,
            tomorrow_fetched: false,
            last_attempt: None,
            error: None,
        }
    }

    /// Promote tomorrow's status into today's when the local date advances,
    /// then reset tomorrow.
    fn reconcile(&mut self, today: NaiveDate) {
        if today == self.today_date {
            return;
        }
        if today == self.tomorrow_date {
            self.today_fetched = self.tomorrow_fetched;
        } else {
            self.today_fetched = false;
        }
        self.today_date = today;
        self.tomorrow_date = today + chrono::Duration::days(1);
        self.tomorrow_fetched = false;
    }
}

pub async fn run(
    shared: Arc<SharedState>,
    api: Arc<ApiClient>,
    tz: Tz,
    tomorrow_poll_start_time: NaiveTime,
    period: StdDuration,
) {
    let mut state = FetcherState::new(time_utils::now_in_tz(tz).date_naive());
    let mut gate_wait_logged = false;

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("data fetcher stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        if !api.has_credentials() {
            continue;
        }

        let now = time_utils::now_in_tz(tz);
        let today = now.date_naive();
        state.reconcile(today);

        if !state.today_fetched {
            fetch_and_apply(&shared, &api, &mut state, tz, state.today_date, "today").await;
            gate_wait_logged = false;
            continue;
        }

        if state.tomorrow_fetched {
            continue;
        }

        if now.time() < tomorrow_poll_start_time {
            if !gate_wait_logged {
                info!("data fetcher: tomorrow poll gate waiting");
                gate_wait_logged = true;
            }
            continue;
        }
        gate_wait_logged = false;
        fetch_and_apply(&shared, &api, &mut state, tz, state.tomorrow_date, "tomorrow").await;
    }
}

async fn fetch_and_apply(
    shared: &SharedState,
    api: &ApiClient,
    state: &mut FetcherState,
    tz: Tz,
    target_date: NaiveDate,
    purpose: &'static str,
) {
    *shared.data_fetcher_status.write() = DataFetcherStatus::Fetching;
    state.last_attempt = Some(Utc::now());

    let start_local = local_midnight_for_date(tz, target_date);
    let start_utc = start_local.with_timezone(&Utc);
    let end_utc = start_utc + chrono::Duration::days(1);

    match api.get_day_ahead_schedules(start_utc, end_utc).await {
        Ok(by_plant) => {
            let both_present = by_plant.get(&PlantId::Lib).is_some_and(|m| !m.is_empty())
                && by_plant.get(&PlantId::Vrfb).is_some_and(|m| !m.is_empty());

            for plant_id in PlantId::ALL {
                let Some(points) = by_plant.get(&plant_id) else { continue };
                if points.is_empty() {
                    continue;
                }
                apply_schedule_window(shared, plant_id, tz, start_utc, end_utc, points);
            }

            if both_present {
                state.error = None;
                *shared.data_fetcher_status.write() = DataFetcherStatus::Ok;
            } else {
                let msg = format!("partial {purpose} response: one or both plants returned no points");
                warn!("data fetcher: {msg}");
                state.error = Some(msg);
                *shared.data_fetcher_status.write() = DataFetcherStatus::Error;
            }

            match purpose {
                "today" => state.today_fetched = both_present,
                "tomorrow" => state.tomorrow_fetched = both_present,
                _ => {}
            }
        }
        Err(err) => {
            warn!(error = %err, purpose, "data fetcher: schedule fetch failed");
            state.error = Some(err.to_string());
            *shared.data_fetcher_status.write() = DataFetcherStatus::Error;
        }
    }
}

fn local_midnight_for_date(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    tz.from_local_datetime(&naive).single().unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

fn apply_schedule_window(
    shared: &SharedState,
    plant_id: PlantId,
    tz: Tz,
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
    points: &HashMap<DateTime<Utc>, f64>,
) {
    let mut sorted: Vec<_> = points.iter().collect();
    sorted.sort_by_key(|(ts, _)| **ts);
    let rows = sorted
        .into_iter()
        .map(|(ts, p)| (ts.with_timezone(&tz), *p, 0.0));

    let mut frame = shared.plant(plant_id).api_schedule.write();
    frame.replace_window(start_utc.with_timezone(&tz), end_utc.with_timezone(&tz), rows);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn reconcile_promotes_tomorrow_into_today_on_rollover() {
        let d0 = NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        let mut state = FetcherState::new(d0);
        state.today_fetched = true;
        state.tomorrow_fetched = true;

        let d1 = d0 + chrono::Duration::days(1);
        state.reconcile(d1);

        assert_eq!(state.today_date, d1);
        assert!(state.today_fetched);
        assert!(!state.tomorrow_fetched);
    }

    #[test]
    fn reconcile_resets_today_fetched_when_tomorrow_was_never_fetched() {
        let d0 = NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        let mut state = FetcherState::new(d0);
        state.today_fetched = true;
        state.tomorrow_fetched = false;

        let d1 = d0 + chrono::Duration::days(1);
        state.reconcile(d1);

        assert!(!state.today_fetched);
    }

    #[test]
    fn reconcile_is_a_no_op_within_the_same_day() {
        let d0 = NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        let mut state = FetcherState::new(d0);
        state.today_fetched = true;
        state.reconcile(d0);
        assert!(state.today_fetched);
    }
}
