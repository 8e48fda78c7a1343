//! Measurement Post Worker (§4.5): drains `PostItem`s from a per-plant
//! bounded FIFO to the day-ahead API, with exponential backoff on failure
//! and a forced re-login-and-retry-once on HTTP 401.
//!
//! Grounded in the original source's `istentore_api.py` posting retry shape,
//! generalized onto a bounded queue per plant so one plant's backoff never
//! starves the other's.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::Receiver;
use tracing::{info, warn};

use crate::api_client::ApiClient;
use crate::domain::{PlantId, PostItem};
use crate::state::SharedState;

pub const QUEUE_MAXLEN: usize = 2000;
const INITIAL_RETRY_S: f64 = 2.0;
const MAX_RETRY_S: f64 = 60.0;
const DRAIN_BATCH: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct PostStatus {
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry_seconds: f64,
}

struct PlantQueue {
    items: VecDeque<PostItem>,
    attempts: u32,
    backoff_until: Option<DateTime<Utc>>,
    status: PostStatus,
}

impl PlantQueue {
    fn new() -> Self {
        Self { items: VecDeque::new(), attempts: 0, backoff_until: None, status: PostStatus::default() }
    }

    /// Push, dropping the oldest item if the bound is exceeded (freshness
    /// over completeness per spec step 5).
    fn push(&mut self, item: PostItem) {
        if self.items.len() >= QUEUE_MAXLEN {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn push_front(&mut self, item: PostItem) {
        self.items.push_front(item);
    }
}

fn series_id_as_i64(series_id: &str) -> Option<i64> {
    series_id.parse().ok()
}

pub async fn run(shared: Arc<SharedState>, api: Arc<ApiClient>, mut rx: Receiver<PostItem>, period: StdDuration) {
    let mut queues: HashMap<PlantId, PlantQueue> = PlantId::ALL.into_iter().map(|id| (id, PlantQueue::new())).collect();

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                info!("measurement post worker stopping");
                return;
            }
            item = rx.recv() => {
                match item {
                    Some(item) => {
                        if let Some(q) = queues.get_mut(&item.plant_id) {
                            q.push(item);
                        }
                        continue;
                    }
                    None => continue,
                }
            }
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        for plant_id in PlantId::ALL {
            let queue = queues.get_mut(&plant_id).expect("seeded for every PlantId");
            if let Some(until) = queue.backoff_until {
                if now < until {
                    continue;
                }
            }
            drain_plant_queue(&api, queue, now).await;
        }
    }
}

async fn drain_plant_queue(api: &ApiClient, queue: &mut PlantQueue, now: DateTime<Utc>) {
    for _ in 0..DRAIN_BATCH {
        let Some(item) = queue.items.pop_front() else { break };
        let Some(value) = item.value else { continue };
        let Some(series_id) = item.series_id.as_deref().and_then(series_id_as_i64) else { continue };

        queue.status.last_attempt = Some(now);
        match api.post_measurement(series_id, value, &item.timestamp_iso).await {
            Ok(()) => {
                queue.attempts = 0;
                queue.backoff_until = None;
                queue.status.last_error = None;
                queue.status.last_success = Some(now);
                queue.status.next_retry_seconds = 0.0;
            }
            Err(err) => {
                warn!(plant = %item.plant_id, metric = item.metric.as_str(), error = %err, "measurement post failed, backing off");
                let delay_s = (INITIAL_RETRY_S * 2f64.powi(queue.attempts as i32)).min(MAX_RETRY_S);
                queue.attempts = queue.attempts.saturating_add(1);
                queue.backoff_until = Some(now + chrono::Duration::milliseconds((delay_s * 1000.0) as i64));
                queue.status.last_error = Some(err.to_string());
                queue.status.next_retry_seconds = delay_s;
                queue.push_front(item);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_item_past_maxlen() {
        let mut q = PlantQueue::new();
        for i in 0..QUEUE_MAXLEN + 5 {
            q.push(PostItem {
                plant_id: PlantId::Lib,
                metric: crate::domain::PostMetric::Soc,
                series_id: Some(i.to_string()),
                value: Some(i as f64),
                timestamp_iso: "2026-07-27T00:00:00+00:00".into(),
            });
        }
        assert_eq!(q.items.len(), QUEUE_MAXLEN);
        assert_eq!(q.items.front().unwrap().series_id.as_deref(), Some("5"));
    }

    #[test]
    fn backoff_delay_grows_exponentially_and_caps() {
        let delay = |attempts: u32| (INITIAL_RETRY_S * 2f64.powi(attempts as i32)).min(MAX_RETRY_S);
        assert_eq!(delay(0), 2.0);
        assert_eq!(delay(1), 4.0);
        assert_eq!(delay(10), MAX_RETRY_S);
    }

    #[test]
    fn series_id_parses_numeric_strings_only() {
        assert_eq!(series_id_as_i64("42"), Some(42));
        assert_eq!(series_id_as_i64("abc"), None);
    }

    fn item(value: f64) -> PostItem {
        PostItem {
            plant_id: PlantId::Lib,
            metric: crate::domain::PostMetric::Soc,
            series_id: Some("101".to_string()),
            value: Some(value),
            timestamp_iso: "2026-07-27T00:00:00+00:00".into(),
        }
    }

    fn client_against(server: &wiremock::MockServer) -> ApiClient {
        ApiClient::new(crate::api_client::ApiClientConfig {
            base_url: server.uri(),
            email: "ops@example.invalid".to_string(),
            password: "secret".to_string(),
        })
    }

    /// A failed post requeues the item and sets backoff; once the API
    /// recovers, the same item drains successfully and backoff clears.
    #[tokio::test]
    async fn failed_post_backs_off_then_recovers_once_api_succeeds() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let failing_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok-1"})))
            .mount(&failing_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/measurements"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing_server)
            .await;

        let failing_api = client_against(&failing_server);
        let mut queue = PlantQueue::new();
        queue.push(item(42.0));

        let t0 = Utc::now();
        drain_plant_queue(&failing_api, &mut queue, t0).await;

        assert_eq!(queue.items.len(), 1, "failed item must be requeued");
        assert_eq!(queue.attempts, 1);
        assert!(queue.backoff_until.is_some());
        assert!(queue.status.last_error.is_some());
        assert_eq!(queue.status.next_retry_seconds, INITIAL_RETRY_S);

        let recovering_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "tok-2"})))
            .mount(&recovering_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/measurements"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&recovering_server)
            .await;

        let recovering_api = client_against(&recovering_server);
        let t1 = t0 + chrono::Duration::seconds(5);
        drain_plant_queue(&recovering_api, &mut queue, t1).await;

        assert!(queue.items.is_empty(), "recovered post must drain the queue");
        assert_eq!(queue.attempts, 0);
        assert!(queue.backoff_until.is_none());
        assert!(queue.status.last_error.is_none());
        assert_eq!(queue.status.last_success, Some(t1));
    }
}
