//! Web Push delivery.
//!
//! Handlers and the reminder scheduler talk to a [`PushSender`]. The
//! production sender signs a VAPID JWT (ES256) per request and posts the
//! notification as JSON, encrypted for the subscription's `p256dh`/`auth`
//! keys with the `aes128gcm` content coding (RFC 8291). The service worker
//! reads that JSON from the push event's data.

use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;

use super::models::{Notification, PushSubscription};
use crate::config::VapidConfig;
use crate::errors::PushError;

/// How long the push service should hold an undelivered message, in seconds.
const PUSH_TTL_SECS: u32 = 24 * 60 * 60;

/// VAPID JWT lifetime. The protocol caps it at 24 hours.
const VAPID_JWT_HOURS: i64 = 12;

/// Abstraction over push delivery for testability.
/// Real implementation: `VapidPushSender`. Test double: `RecordingPushSender`.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(
        &self,
        subscription: &PushSubscription,
        notification: &Notification,
    ) -> Result<(), PushError>;
}

/// Pick the sender for the configured VAPID keys. An unusable key is
/// logged and leaves push disabled rather than failing startup.
pub fn sender_from_config(vapid: Option<&VapidConfig>) -> Arc<dyn PushSender> {
    match vapid {
        Some(cfg) => match VapidPushSender::new(cfg) {
            Ok(sender) => Arc::new(sender),
            Err(e) => {
                tracing::error!(error = %e, "push notifications disabled");
                Arc::new(DisabledPushSender)
            }
        },
        None => {
            tracing::warn!("VAPID keys not configured; push notifications disabled");
            Arc::new(DisabledPushSender)
        }
    }
}

// ── Disabled ─────────────────────────────────────────────────────────

pub struct DisabledPushSender;

#[async_trait]
impl PushSender for DisabledPushSender {
    async fn send(&self, _: &PushSubscription, _: &Notification) -> Result<(), PushError> {
        Err(PushError::NotConfigured)
    }
}

// ── VAPID ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct VapidClaims {
    aud: String,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
}

pub struct VapidPushSender {
    client: reqwest::Client,
    key: EncodingKey,
    public_key: String,
    subject: Option<String>,
}

impl VapidPushSender {
    pub fn new(cfg: &VapidConfig) -> Result<Self, PushError> {
        let key = EncodingKey::from_ec_pem(cfg.private_key_pem.as_bytes())
            .map_err(|e| PushError::InvalidKey(e.to_string()))?;
        let subject = cfg.claim_email.as_ref().map(|email| {
            if email.starts_with("mailto:") || email.starts_with("https:") {
                email.clone()
            } else {
                format!("mailto:{}", email)
            }
        });
        Ok(Self {
            client: reqwest::Client::new(),
            key,
            public_key: cfg.public_key.clone(),
            subject,
        })
    }

    /// `Authorization` header value for one endpoint.
    fn authorization(&self, endpoint: &str) -> Result<String, PushError> {
        let jwt = encode(
            &Header::new(Algorithm::ES256),
            &VapidClaims {
                aud: audience(endpoint)?,
                exp: (Utc::now() + chrono::Duration::hours(VAPID_JWT_HOURS)).timestamp(),
                sub: self.subject.clone(),
            },
            &self.key,
        )
        .map_err(|e| PushError::InvalidKey(e.to_string()))?;
        Ok(format!("vapid t={}, k={}", jwt, self.public_key))
    }
}

/// Browsers hand out unpadded base64url keys; padded input is accepted too.
fn decode_key(field: &str, value: &str) -> Result<Vec<u8>, PushError> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(value))
        .map_err(|e| PushError::Encryption(format!("{} is not base64url: {}", field, e)))
}

/// The notification as the encrypted `aes128gcm` request body.
pub fn encrypt_payload(
    subscription: &PushSubscription,
    notification: &Notification,
) -> Result<Vec<u8>, PushError> {
    let p256dh = decode_key("p256dh", &subscription.p256dh)?;
    let auth = decode_key("auth", &subscription.auth)?;
    let payload = serde_json::to_vec(notification)
        .map_err(|e| PushError::Encryption(e.to_string()))?;
    ece::encrypt(&p256dh, &auth, &payload).map_err(|e| PushError::Encryption(e.to_string()))
}

/// The JWT audience is the origin of the push service.
fn audience(endpoint: &str) -> Result<String, PushError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| PushError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(PushError::InvalidEndpoint(endpoint.to_string()));
    }
    Ok(url.origin().ascii_serialization())
}

#[async_trait]
impl PushSender for VapidPushSender {
    async fn send(
        &self,
        subscription: &PushSubscription,
        notification: &Notification,
    ) -> Result<(), PushError> {
        let authorization = self.authorization(&subscription.endpoint)?;
        let body = encrypt_payload(subscription, notification)?;
        let resp = self
            .client
            .post(&subscription.endpoint)
            .header("Authorization", authorization)
            .header("TTL", PUSH_TTL_SECS.to_string())
            .header("Urgency", "normal")
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!(user_id = subscription.user_id, tag = %notification.tag, "push delivered");
            return Ok(());
        }
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(PushError::Gone {
                status: status.as_u16(),
            });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PushError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

// ── Test double ──────────────────────────────────────────────────────

/// Records every notification; optionally fails each send.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingPushSender {
    pub sent: Mutex<Vec<(i64, Notification)>>,
    pub fail_with_gone: bool,
}

#[cfg(test)]
impl RecordingPushSender {
    pub fn tags(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|s| s.iter().map(|(_, n)| n.tag.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(
        &self,
        subscription: &PushSubscription,
        notification: &Notification,
    ) -> Result<(), PushError> {
        if self.fail_with_gone {
            return Err(PushError::Gone { status: 410 });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((subscription.user_id, notification.clone()));
        }
        Ok(())
    }
}
