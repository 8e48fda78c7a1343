//! Day-ahead market API client: bearer-token login, 401-retry-once, and the
//! day-ahead schedule / measurement-posting endpoints.
//!
//! Grounded in the original source's `istentore_api.py`: a single `/login`
//! call exchanges email+password for a bearer token; every authenticated
//! call retries exactly once after a forced re-login on HTTP 401, then
//! surfaces the error as transient.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::PlantId;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authenticated and no credentials configured")]
    NoCredentials,
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

pub struct ApiClientConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
}

/// Bearer-token client for the day-ahead market API.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    email: String,
    password: RwLock<String>,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url,
            email: config.email,
            password: RwLock::new(config.password),
            token: RwLock::new(None),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn has_credentials(&self) -> bool {
        !self.password.read().is_empty()
    }

    /// `api.connect {password?}`: operator-supplied credential update,
    /// applied before the next login attempt.
    pub fn set_password(&self, password: String) {
        *self.password.write() = password;
    }

    pub async fn login(&self) -> Result<(), ApiError> {
        let password = self.password.read().clone();
        if password.is_empty() {
            return Err(ApiError::NoCredentials);
        }
        let url = format!("{}/login", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "email": self.email, "password": password }))
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::Authentication(format!("status {}", response.status())));
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }
        let body: LoginResponse = response.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        *self.token.write() = Some(body.token);
        tracing::info!("day-ahead API: authentication successful");
        Ok(())
    }

    async fn ensure_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.token.read().clone() {
            return Ok(token);
        }
        self.login().await?;
        self.token.read().clone().ok_or(ApiError::NoCredentials)
    }

    /// Fetch day-ahead schedules for both plants over `[start, end]`, keyed
    /// by plant then UTC timestamp.
    pub async fn get_day_ahead_schedules(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<PlantId, HashMap<DateTime<Utc>, f64>>, ApiError> {
        let raw = self.get_market_products(4, Some(start), Some(end)).await?;
        let mut lib = HashMap::new();
        let mut vrfb = HashMap::new();

        if let Some(market) = raw.first() {
            if let Some(periods) = market.get("delivery_periods").and_then(|v| v.as_array()) {
                for period in periods {
                    let Some(delivery_period_str) = period.get("delivery_period").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let Ok(delivery_dt) = DateTime::parse_from_rfc3339(delivery_period_str) else {
                        continue;
                    };
                    let delivery_dt = delivery_dt.with_timezone(&Utc);

                    let activation = period
                        .get("activation")
                        .and_then(|v| v.as_array())
                        .and_then(|a| a.first())
                        .cloned()
                        .unwrap_or(serde_json::json!({}));

                    let lib_kw = json_f64(&activation, "lib_to_vpp_kw") - json_f64(&activation, "vpp_to_lib_kw");
                    let vrfb_kw = json_f64(&activation, "vrfb_to_vpp_kw") - json_f64(&activation, "vpp_to_vrfb_kw");
                    lib.insert(delivery_dt, lib_kw);
                    vrfb.insert(delivery_dt, vrfb_kw);
                }
            }
        }

        let mut result = HashMap::new();
        result.insert(PlantId::Lib, lib);
        result.insert(PlantId::Vrfb, vrfb);
        Ok(result)
    }

    async fn get_market_products(
        &self,
        market_id: u32,
        delivery_period_gte: Option<DateTime<Utc>>,
        delivery_period_lte: Option<DateTime<Utc>>,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        self.get_market_products_attempt(market_id, delivery_period_gte, delivery_period_lte, true)
            .await
    }

    async fn get_market_products_attempt(
        &self,
        market_id: u32,
        delivery_period_gte: Option<DateTime<Utc>>,
        delivery_period_lte: Option<DateTime<Utc>>,
        allow_relogin: bool,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let token = self.ensure_token().await?;
        let url = format!("{}/market_products", self.base_url);
        let mut query = vec![("id", market_id.to_string())];
        if let Some(gte) = delivery_period_gte {
            query.push(("delivery_period_gte", gte.format("%Y-%m-%dT%H:%M:%S+00:00").to_string()));
        }
        if let Some(lte) = delivery_period_lte {
            query.push(("delivery_period_lte", lte.format("%Y-%m-%dT%H:%M:%S+00:00").to_string()));
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if allow_relogin {
                tracing::warn!("day-ahead API: token expired, re-authenticating");
                *self.token.write() = None;
                self.login().await?;
                return Box::pin(self.get_market_products_attempt(market_id, delivery_period_gte, delivery_period_lte, false)).await;
            }
            return Err(ApiError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(ApiError::Http(format!("status {}", response.status())));
        }
        response.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Post one measurement value to a numeric measurement series, retrying
    /// once after a forced re-login on 401.
    pub async fn post_measurement(&self, series_id: i64, value: f64, timestamp_iso: &str) -> Result<(), ApiError> {
        self.post_measurement_attempt(series_id, value, timestamp_iso, true).await
    }

    async fn post_measurement_attempt(
        &self,
        series_id: i64,
        value: f64,
        timestamp_iso: &str,
        allow_relogin: bool,
    ) -> Result<(), ApiError> {
        let token = self.ensure_token().await?;
        let url = format!("{}/measurements", self.base_url);
        let payload = serde_json::json!({
            "measurement_series": series_id,
            "measurements": [{ "timestamp": timestamp_iso, "measurement": value }],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if allow_relogin {
                tracing::warn!("day-ahead API: token expired while posting, re-authenticating");
                *self.token.write() = None;
                self.login().await?;
                return Box::pin(self.post_measurement_attempt(series_id, value, timestamp_iso, false)).await;
            }
            return Err(ApiError::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(ApiError::Http(format!("status {}", response.status())));
        }
        Ok(())
    }
}

fn json_f64(value: &serde_json::Value, key: &str) -> f64 {
    value.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_f64_defaults_to_zero_for_missing_key() {
        let v = serde_json::json!({});
        assert_eq!(json_f64(&v, "lib_to_vpp_kw"), 0.0);
    }

    #[test]
    fn json_f64_reads_present_numeric_key() {
        let v = serde_json::json!({"lib_to_vpp_kw": 12.5});
        assert_eq!(json_f64(&v, "lib_to_vpp_kw"), 12.5);
    }
}
