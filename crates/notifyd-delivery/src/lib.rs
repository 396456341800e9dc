//! notifyd-delivery — client for the upstream notification-delivery SDK.
//!
//! This daemon's wire protocol with the SDK is explicitly out of scope
//! (spec §1); what's specified is the one call shape C6's Dispatch activity
//! needs: `trigger(workflow_key, {to, payload, overrides}) -> transaction_id`
//! (spec §6). The HTTP implementation here is reshaped from
//! `mqk-broker-alpaca`'s role as "the live adapter to an external
//! counterparty" — async `reqwest` rather than the teacher's
//! `block_in_place` wrapper, since this daemon has no blocking-runtime
//! constraint to work around.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct TriggerRequest<'a> {
    pub workflow_key: &'a str,
    pub to: &'a [String],
    pub payload: &'a Value,
    pub overrides: Option<&'a Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TriggerResponse {
    pub transaction_id: String,
}

/// The Dispatch activity's one collaborator (spec §4.6 step 3). Assumed
/// idempotent given a stable `transaction_id` supplied by the caller — this
/// trait doesn't supply one; the upstream SDK mints it and this call is the
/// retry unit, relying on downstream dedup (spec §6).
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn trigger(
        &self,
        workflow_key: &str,
        to: &[String],
        payload: &Value,
        overrides: Option<&Value>,
    ) -> anyhow::Result<String>;
}

/// Error classification the Pipeline needs to decide retryability
/// (spec §7 "Delivery").
#[derive(Debug)]
pub enum DeliveryError {
    /// Network/5xx/timeout — retry under the activity's backoff policy.
    Transient(anyhow::Error),
    /// 4xx other than auth/rate-limit — retrying with the same input will
    /// fail identically.
    Rejected(anyhow::Error),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Transient(e) => write!(f, "transient delivery error: {e}"),
            DeliveryError::Rejected(e) => write!(f, "rejected delivery: {e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

pub struct HttpDeliveryClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpDeliveryClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn trigger(
        &self,
        workflow_key: &str,
        to: &[String],
        payload: &Value,
        overrides: Option<&Value>,
    ) -> anyhow::Result<String> {
        let body = TriggerRequest {
            workflow_key,
            to,
            payload,
            overrides,
        };

        let resp = self
            .http
            .post(format!("{}/v1/events/trigger", self.base_url))
            .bearer_auth(&self.secret)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("delivery SDK returned {status}: {text}");
            return Err(if status.is_server_error() {
                DeliveryError::Transient(err).into()
            } else {
                DeliveryError::Rejected(err).into()
            });
        }

        let parsed: TriggerResponse = resp.json().await?;
        Ok(parsed.transaction_id)
    }
}
