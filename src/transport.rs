use async_trait::async_trait;

use crate::error::FailureReason;
use crate::types::WebhookEvent;

/// The delivery side effect.
///
/// Invoked only for claimed (PROCESSING) events, at most once per
/// attempt. The scheduler wraps every call in a bounded timeout and
/// treats a timeout like any other failure.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, event: &WebhookEvent) -> Result<(), FailureReason>;
}

/// HTTP delivery: POST the payload to a fixed URL, optionally signed.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    signing: Option<crate::signing::SigningConfig>,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            signing: None,
        }
    }

    pub fn with_signing(mut self, signing: crate::signing::SigningConfig) -> Self {
        self.signing = Some(signing);
        self
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, event: &WebhookEvent) -> Result<(), FailureReason> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event-Type", &event.event_type)
            .header("X-Webhook-Idempotency-Key", event.idempotency_key.as_str())
            .body(event.payload.clone());

        if let Some(ref signing) = self.signing {
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string();
            let signature =
                crate::signing::compute_signature(&signing.secret, &event.payload, Some(&timestamp));
            request = request
                .header(&signing.signature_header, signature)
                .header(&signing.timestamp_header, timestamp);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else if status.is_client_error() {
                    Err(FailureReason::ClientError(status.as_u16()))
                } else {
                    Err(FailureReason::RemoteError(status.as_u16()))
                }
            }
            Err(err) => {
                if err.is_timeout() {
                    Err(FailureReason::Timeout)
                } else {
                    Err(FailureReason::Network(err.to_string()))
                }
            }
        }
    }
}

/// Test transport that fails a fixed number of times, then succeeds.
pub struct FlakyTransport {
    failures_remaining: std::sync::atomic::AtomicU32,
    attempts: std::sync::atomic::AtomicU32,
}

impl FlakyTransport {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_remaining: std::sync::atomic::AtomicU32::new(times),
            attempts: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn deliver(&self, _event: &WebhookEvent) -> Result<(), FailureReason> {
        use std::sync::atomic::Ordering;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            Err(FailureReason::RemoteError(503))
        } else {
            Ok(())
        }
    }
}
