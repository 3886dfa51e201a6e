//! Agent-to-agent handoff protocol: a signed, expiring payload carrying
//! task context from one agent to the next.
//!
//! Signing is HMAC-SHA-256 over the canonical JSON encoding of the
//! signable-field projection (sorted keys, ASCII-escaped, UTF-8).
//! Symmetric signing keeps key management trivial for intra-system
//! trust; the shared secret comes from the environment
//! (`NEXUS_HANDOFF_SECRET`) or an explicit override. Expired payloads
//! are rejected before any crypto work.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::HANDOFF_SECRET_ENV;
use crate::error::{Error, Result};
use crate::runtime::{AgentLaunch, AgentRuntime};

type HmacSha256 = Hmac<Sha256>;

const SIGN_FIELDS: [&str; 8] = [
    "handoff_id",
    "issued_by",
    "target_agent",
    "issue_number",
    "workflow_id",
    "task_context",
    "created_at",
    "expires_at",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffPayload {
    pub handoff_id: String,
    pub issued_by: String,
    pub target_agent: String,
    pub issue_number: String,
    pub workflow_id: String,
    #[serde(default)]
    pub task_context: Map<String, Value>,
    /// HMAC-SHA-256 hex digest set by [`sign_handoff`].
    #[serde(default)]
    pub verification_token: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_seconds: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> f64 {
    5.0
}

impl HandoffPayload {
    /// Create a new, unsigned payload. Sign it before dispatch.
    pub fn new(
        issued_by: impl Into<String>,
        target_agent: impl Into<String>,
        issue_number: impl Into<String>,
        workflow_id: impl Into<String>,
        task_context: Map<String, Value>,
    ) -> Self {
        Self {
            handoff_id: Uuid::new_v4().to_string(),
            issued_by: issued_by.into(),
            target_agent: target_agent.into(),
            issue_number: issue_number.into(),
            workflow_id: workflow_id.into(),
            task_context,
            verification_token: String::new(),
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            retry_backoff_seconds: default_retry_backoff(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now > expiry)
    }
}

/// Canonical JSON bytes of the signable-field projection: sorted keys,
/// non-ASCII escaped.
fn canonical_bytes(payload: &HandoffPayload) -> Result<Vec<u8>> {
    let value = serde_json::to_value(payload)?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidOperation("handoff payload is not an object".to_string()))?;

    let mut signable = BTreeMap::new();
    for field in SIGN_FIELDS {
        signable.insert(field, object.get(field).cloned().unwrap_or(Value::Null));
    }
    let encoded = serde_json::to_string(&signable)?;
    Ok(escape_non_ascii(&encoded).into_bytes())
}

fn escape_non_ascii(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compute the HMAC-SHA-256 token for a payload. The result is not
/// written back; the caller assigns it to `verification_token`.
pub fn sign_handoff(payload: &HandoffPayload, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidOperation(format!("HMAC key error: {e}")))?;
    mac.update(&canonical_bytes(payload)?);
    Ok(hex_digest(&mac.finalize().into_bytes()))
}

/// Verify `verification_token` with a constant-time comparison.
pub fn verify_handoff(payload: &HandoffPayload, secret: &str) -> Result<bool> {
    let expected = sign_handoff(payload, secret)?;
    Ok(constant_time_eq(
        expected.as_bytes(),
        payload.verification_token.as_bytes(),
    ))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Dispatches signed handoff payloads to target agents through the host
/// [`AgentRuntime`] with expiry enforcement and exponential backoff.
pub struct HandoffDispatcher {
    secret_env: String,
    explicit_secret: Option<String>,
}

impl Default for HandoffDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffDispatcher {
    pub fn new() -> Self {
        Self {
            secret_env: HANDOFF_SECRET_ENV.to_string(),
            explicit_secret: None,
        }
    }

    pub fn with_secret_env(secret_env: impl Into<String>) -> Self {
        Self {
            secret_env: secret_env.into(),
            explicit_secret: None,
        }
    }

    /// Bypass the environment, mainly for tests.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret_env: HANDOFF_SECRET_ENV.to_string(),
            explicit_secret: Some(secret.into()),
        }
    }

    fn secret(&self) -> Result<String> {
        if let Some(secret) = &self.explicit_secret {
            if !secret.is_empty() {
                return Ok(secret.clone());
            }
        }
        match std::env::var(&self.secret_env) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::MissingSecret(self.secret_env.clone())),
        }
    }

    /// Sign and dispatch the payload, retrying launch failures with
    /// exponential backoff up to `max_retries + 1` attempts.
    ///
    /// Expired payloads fail with [`Error::Expired`] before the signature
    /// is computed.
    pub async fn dispatch(
        &self,
        payload: &mut HandoffPayload,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Result<AgentLaunch> {
        if payload.is_expired(Utc::now()) {
            tracing::error!(
                "Handoff {} rejected: payload expired at {:?}",
                payload.handoff_id,
                payload.expires_at
            );
            return Err(Error::Expired(
                payload
                    .expires_at
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_default(),
            ));
        }

        let secret = self.secret()?;
        payload.verification_token = sign_handoff(payload, &secret)?;

        let max_attempts = payload.max_retries + 1;
        let trigger = format!("handoff:{}", payload.handoff_id);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            payload.retry_count = attempt;
            if attempt > 0 {
                let backoff =
                    payload.retry_backoff_seconds * 2f64.powi(attempt.saturating_sub(1) as i32);
                tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
            }
            tracing::info!(
                "Dispatching handoff {} -> {} (attempt {}/{max_attempts})",
                payload.issued_by,
                payload.target_agent,
                attempt + 1
            );

            match runtime
                .launch_agent(&payload.issue_number, &payload.target_agent, &trigger)
                .await
            {
                Ok(Some(launch)) => {
                    tracing::info!(
                        "Handoff {} dispatched (pid={}, tool={})",
                        payload.handoff_id,
                        launch.pid,
                        launch.tool
                    );
                    return Ok(launch);
                }
                Ok(None) => {
                    last_error = "runtime declined launch".to_string();
                    tracing::warn!(
                        "Handoff {} launch declined on attempt {}",
                        payload.handoff_id,
                        attempt + 1
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        "Handoff {} launch errored on attempt {}: {e}",
                        payload.handoff_id,
                        attempt + 1
                    );
                }
            }
        }

        Err(Error::Transient(format!(
            "handoff {} exhausted {max_attempts} attempts: {last_error}",
            payload.handoff_id
        )))
    }
}
