use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::VerificationError;

/// HMAC configuration shared by outbound signing and inbound
/// verification.
#[derive(Debug, Clone)]
pub struct SigningConfig {
    pub secret: Vec<u8>,
    pub signature_header: String,
    pub timestamp_header: String,
    /// Freshness window for inbound timestamps, in seconds.
    pub max_age_secs: u64,
}

impl SigningConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            signature_header: "X-Webhook-Signature".to_string(),
            timestamp_header: "X-Webhook-Timestamp".to_string(),
            max_age_secs: 300,
        }
    }
}

/// Compute the hex HMAC-SHA256 over the timestamp concatenated with the
/// payload (or the payload alone when no timestamp is used).
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: Option<&str>) -> String {
    let mut mac = new_mac(secret);
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a received hex signature.
pub fn verify_signature(
    secret: &[u8],
    payload: &[u8],
    timestamp: Option<&str>,
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = new_mac(secret);
    if let Some(ts) = timestamp {
        mac.update(ts.as_bytes());
    }
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

fn new_mac(secret: &[u8]) -> Hmac<Sha256> {
    // HMAC-SHA256 accepts keys of any length.
    Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length")
}

fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

/// Verify an inbound notification before admission: header presence,
/// timestamp freshness, then the MAC itself.
pub fn verify_notification<'a, I>(
    config: &SigningConfig,
    headers: I,
    payload: &[u8],
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let sig_key = config.signature_header.to_ascii_lowercase();
    let ts_key = config.timestamp_header.to_ascii_lowercase();

    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        if key == sig_key {
            signature = Some(value.to_string());
        } else if key == ts_key {
            timestamp = Some(value.to_string());
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp = timestamp.ok_or(VerificationError::MissingTimestamp)?;
    let timestamp_secs = timestamp
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp_secs, now_secs, config.max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(&config.secret, payload, Some(&timestamp), &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
