use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::{SignatureConfig, SignatureProvider};

type HmacSha256 = Hmac<Sha256>;

/// Why signature verification failed (§4.2). `Crypto` covers any exception
/// out of the hashing primitives themselves — per spec this path must never
/// panic, only report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    NoSecret,
    MissingHeader,
    InvalidFormat,
    TimestampTolerance,
    Crypto(String),
}

impl SignatureError {
    pub fn code(&self) -> &'static str {
        match self {
            SignatureError::NoSecret => "NO_SECRET",
            SignatureError::MissingHeader => "MISSING_HEADER",
            SignatureError::InvalidFormat => "INVALID_FORMAT",
            SignatureError::TimestampTolerance => "TIMESTAMP_TOLERANCE",
            SignatureError::Crypto(_) => "CRYPTO_ERROR",
        }
    }
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Crypto(msg) => write!(f, "{}: {msg}", self.code()),
            other => write!(f, "{}", other.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutcome {
    pub valid: bool,
    pub provider: SignatureProvider,
    pub error: Option<SignatureError>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn within_tolerance(ts: i64, now: i64, tolerance: i64) -> bool {
    (now - ts).abs() <= tolerance
}

/// Eager verification: the full raw body is already buffered (§4.2).
pub fn verify(config: &SignatureConfig, payload: &[u8], headers: &HeaderMap, now: i64) -> SignatureOutcome {
    if config.secret.is_empty() {
        return outcome(config.provider, Err(SignatureError::NoSecret));
    }

    let result = match config.provider {
        SignatureProvider::Github => verify_github(config, payload, headers),
        SignatureProvider::Shopify => verify_shopify(config, payload, headers, now),
        SignatureProvider::Stripe => verify_stripe(config, payload, headers, now),
        SignatureProvider::Slack => verify_slack(config, payload, headers, now),
        SignatureProvider::Custom => verify_custom(config, payload, headers, now),
    };

    outcome(config.provider, result)
}

fn outcome(provider: SignatureProvider, result: Result<(), SignatureError>) -> SignatureOutcome {
    match result {
        Ok(()) => SignatureOutcome { valid: true, provider, error: None },
        Err(err) => SignatureOutcome { valid: false, provider, error: Some(err) },
    }
}

fn hmac_hex(secret: &[u8], data: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn hmac_base64(secret: &[u8], data: &[u8]) -> Result<String, SignatureError> {
    use base64::Engine;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| SignatureError::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn verify_github(config: &SignatureConfig, payload: &[u8], headers: &HeaderMap) -> Result<(), SignatureError> {
    let raw = header(headers, "x-hub-signature-256").ok_or(SignatureError::MissingHeader)?;
    let hex_part = raw.strip_prefix("sha256=").ok_or(SignatureError::InvalidFormat)?;
    let expected = hmac_hex(config.secret.as_bytes(), payload)?;
    if constant_time_eq(hex_part, &expected) {
        Ok(())
    } else {
        Err(SignatureError::InvalidFormat)
    }
}

fn verify_shopify(
    config: &SignatureConfig,
    payload: &[u8],
    headers: &HeaderMap,
    now: i64,
) -> Result<(), SignatureError> {
    let received = header(headers, "x-shopify-hmac-sha256").ok_or(SignatureError::MissingHeader)?;
    let expected = hmac_base64(config.secret.as_bytes(), payload)?;
    if !constant_time_eq(&received, &expected) {
        return Err(SignatureError::InvalidFormat);
    }

    if let (Some(triggered_at), Some(tolerance)) =
        (header(headers, "x-shopify-triggered-at"), config.tolerance)
    {
        let ts: DateTime<Utc> = triggered_at
            .parse()
            .map_err(|_| SignatureError::InvalidFormat)?;
        if !within_tolerance(ts.timestamp(), now, tolerance) {
            return Err(SignatureError::TimestampTolerance);
        }
    }
    Ok(())
}

fn verify_stripe(
    config: &SignatureConfig,
    payload: &[u8],
    headers: &HeaderMap,
    now: i64,
) -> Result<(), SignatureError> {
    let raw = header(headers, "stripe-signature").ok_or(SignatureError::MissingHeader)?;
    let mut ts: Option<i64> = None;
    let mut v1: Option<String> = None;
    for part in raw.split(',') {
        if let Some((k, v)) = part.split_once('=') {
            match k {
                "t" => ts = v.parse().ok(),
                "v1" => v1 = Some(v.to_string()),
                _ => {}
            }
        }
    }
    let (ts, v1) = match (ts, v1) {
        (Some(ts), Some(v1)) => (ts, v1),
        _ => return Err(SignatureError::InvalidFormat),
    };

    if let Some(tolerance) = config.tolerance {
        if !within_tolerance(ts, now, tolerance) {
            return Err(SignatureError::TimestampTolerance);
        }
    }

    let signed = format!("{ts}.{}", String::from_utf8_lossy(payload));
    let expected = hmac_hex(config.secret.as_bytes(), signed.as_bytes())?;
    if constant_time_eq(&v1, &expected) {
        Ok(())
    } else {
        Err(SignatureError::InvalidFormat)
    }
}

fn verify_slack(
    config: &SignatureConfig,
    payload: &[u8],
    headers: &HeaderMap,
    now: i64,
) -> Result<(), SignatureError> {
    let received = header(headers, "x-slack-signature").ok_or(SignatureError::MissingHeader)?;
    let ts_header = header(headers, "x-slack-request-timestamp").ok_or(SignatureError::MissingHeader)?;
    let ts: i64 = ts_header.parse().map_err(|_| SignatureError::InvalidFormat)?;

    if let Some(tolerance) = config.tolerance {
        if !within_tolerance(ts, now, tolerance) {
            return Err(SignatureError::TimestampTolerance);
        }
    }

    let hex_part = received.strip_prefix("v0=").ok_or(SignatureError::InvalidFormat)?;
    let signed = format!("v0:{ts}:{}", String::from_utf8_lossy(payload));
    let expected = hmac_hex(config.secret.as_bytes(), signed.as_bytes())?;
    if constant_time_eq(hex_part, &expected) {
        Ok(())
    } else {
        Err(SignatureError::InvalidFormat)
    }
}

fn verify_custom(
    config: &SignatureConfig,
    payload: &[u8],
    headers: &HeaderMap,
    now: i64,
) -> Result<(), SignatureError> {
    let header_name = config.header_name.as_deref().unwrap_or("x-webhook-signature");
    let received = header(headers, header_name).ok_or(SignatureError::MissingHeader)?;
    let expected = hmac_hex(config.secret.as_bytes(), payload)?;
    if !constant_time_eq(&received, &expected) {
        return Err(SignatureError::InvalidFormat);
    }

    if let (Some(ts_key), Some(tolerance)) = (&config.timestamp_key, config.tolerance) {
        if let Some(ts_header) = header(headers, ts_key) {
            let ts: i64 = ts_header.parse().map_err(|_| SignatureError::InvalidFormat)?;
            if !within_tolerance(ts, now, tolerance) {
                return Err(SignatureError::TimestampTolerance);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Streaming verifier — used when the body has not been buffered yet (§4.2)
// ---------------------------------------------------------------------------

/// Incrementally HMACs request bytes as they arrive, avoiding a full-body
/// buffer before verification. Only `github`/`custom`/`slack` providers (raw
/// or prefixed body over the whole payload) are meaningfully streamable;
/// `shopify` and `stripe` share the same raw-body-HMAC shape once their
/// prefix (if any) is primed before the first chunk.
pub struct StreamVerifier {
    mac: Option<HmacSha256>,
    expected: Option<String>,
    expected_is_base64: bool,
    error: Option<SignatureError>,
    provider: SignatureProvider,
}

impl StreamVerifier {
    pub fn new(config: &SignatureConfig, headers: &HeaderMap) -> Self {
        if config.secret.is_empty() {
            return Self::failed(config.provider, SignatureError::NoSecret);
        }

        let mac = match HmacSha256::new_from_slice(config.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(e) => return Self::failed(config.provider, SignatureError::Crypto(e.to_string())),
        };

        let (expected, expected_is_base64, prefix) = match config.provider {
            SignatureProvider::Github => {
                match header(headers, "x-hub-signature-256").and_then(|v| v.strip_prefix("sha256=").map(str::to_string)) {
                    Some(sig) => (Some(sig), false, None),
                    None => return Self::failed(config.provider, SignatureError::MissingHeader),
                }
            }
            SignatureProvider::Shopify => {
                match header(headers, "x-shopify-hmac-sha256") {
                    Some(sig) => (Some(sig), true, None),
                    None => return Self::failed(config.provider, SignatureError::MissingHeader),
                }
            }
            SignatureProvider::Slack => {
                let sig = header(headers, "x-slack-signature").and_then(|v| v.strip_prefix("v0=").map(str::to_string));
                let ts = header(headers, "x-slack-request-timestamp");
                match (sig, ts) {
                    (Some(sig), Some(ts)) => (Some(sig), false, Some(format!("v0:{ts}:"))),
                    _ => return Self::failed(config.provider, SignatureError::MissingHeader),
                }
            }
            SignatureProvider::Custom => {
                let header_name = config.header_name.as_deref().unwrap_or("x-webhook-signature");
                match header(headers, header_name) {
                    Some(sig) => (Some(sig), false, None),
                    None => return Self::failed(config.provider, SignatureError::MissingHeader),
                }
            }
            SignatureProvider::Stripe => {
                // Stripe's signed data is `t.<body>`; the timestamp must be primed
                // as a prefix before any chunk arrives, same mechanism as Slack.
                let raw = match header(headers, "stripe-signature") {
                    Some(raw) => raw,
                    None => return Self::failed(config.provider, SignatureError::MissingHeader),
                };
                let mut ts = None;
                let mut v1 = None;
                for part in raw.split(',') {
                    if let Some((k, v)) = part.split_once('=') {
                        match k {
                            "t" => ts = Some(v.to_string()),
                            "v1" => v1 = Some(v.to_string()),
                            _ => {}
                        }
                    }
                }
                match (ts, v1) {
                    (Some(ts), Some(v1)) => (Some(v1), false, Some(format!("{ts}."))),
                    _ => return Self::failed(config.provider, SignatureError::InvalidFormat),
                }
            }
        };

        let mut mac = mac;
        if let Some(prefix) = prefix {
            mac.update(prefix.as_bytes());
        }

        Self {
            mac: Some(mac),
            expected,
            expected_is_base64,
            error: None,
            provider: config.provider,
        }
    }

    fn failed(provider: SignatureProvider, error: SignatureError) -> Self {
        Self { mac: None, expected: None, expected_is_base64: false, error: Some(error), provider }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        if let Some(mac) = self.mac.as_mut() {
            mac.update(chunk);
        }
    }

    pub fn finalize(self) -> SignatureOutcome {
        if let Some(error) = self.error {
            return SignatureOutcome { valid: false, provider: self.provider, error: Some(error) };
        }
        let (Some(mac), Some(expected)) = (self.mac, self.expected) else {
            return SignatureOutcome {
                valid: false,
                provider: self.provider,
                error: Some(SignatureError::InvalidFormat),
            };
        };
        let digest = mac.finalize().into_bytes();
        let computed = if self.expected_is_base64 {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(digest)
        } else {
            hex::encode(digest)
        };
        if constant_time_eq(&computed, &expected) {
            SignatureOutcome { valid: true, provider: self.provider, error: None }
        } else {
            SignatureOutcome { valid: false, provider: self.provider, error: Some(SignatureError::InvalidFormat) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: SignatureProvider, secret: &str) -> SignatureConfig {
        SignatureConfig {
            provider,
            secret: secret.to_string(),
            header_name: None,
            timestamp_key: None,
            tolerance: Some(300),
        }
    }

    #[test]
    fn github_roundtrip() {
        let cfg = config(SignatureProvider::Github, "shh");
        let body = br#"{"ok":true}"#;
        let sig = hmac_hex(b"shh", body).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", format!("sha256={sig}").parse().unwrap());

        let outcome = verify(&cfg, body, &headers, 0);
        assert!(outcome.valid);
    }

    #[test]
    fn github_bad_signature_is_rejected() {
        let cfg = config(SignatureProvider::Github, "shh");
        let body = br#"{"ok":true}"#;
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", "sha256=deadbeef".parse().unwrap());

        let outcome = verify(&cfg, body, &headers, 0);
        assert!(!outcome.valid);
        assert_eq!(outcome.error, Some(SignatureError::InvalidFormat));
    }

    #[test]
    fn stripe_roundtrip_with_tolerance() {
        let cfg = config(SignatureProvider::Stripe, "shh");
        let body = b"payload";
        let ts = 1_000_000i64;
        let signed = format!("{ts}.payload");
        let v1 = hmac_hex(b"shh", signed.as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("stripe-signature", format!("t={ts},v1={v1}").parse().unwrap());

        let outcome = verify(&cfg, body, &headers, ts);
        assert!(outcome.valid);
    }

    #[test]
    fn stripe_outside_tolerance_fails() {
        let cfg = config(SignatureProvider::Stripe, "shh");
        let body = b"payload";
        let ts = 1_000_000i64;
        let signed = format!("{ts}.payload");
        let v1 = hmac_hex(b"shh", signed.as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("stripe-signature", format!("t={ts},v1={v1}").parse().unwrap());

        let outcome = verify(&cfg, body, &headers, ts + 10_000);
        assert_eq!(outcome.error, Some(SignatureError::TimestampTolerance));
    }

    #[test]
    fn slack_roundtrip() {
        let cfg = config(SignatureProvider::Slack, "shh");
        let ts = 500i64;
        let body = b"payload";
        let signed = format!("v0:{ts}:payload");
        let v0 = hmac_hex(b"shh", signed.as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-slack-signature", format!("v0={v0}").parse().unwrap());
        headers.insert("x-slack-request-timestamp", ts.to_string().parse().unwrap());

        let outcome = verify(&cfg, body, &headers, ts);
        assert!(outcome.valid);
    }

    #[test]
    fn missing_secret_reports_no_secret() {
        let cfg = config(SignatureProvider::Github, "");
        let outcome = verify(&cfg, b"body", &HeaderMap::new(), 0);
        assert_eq!(outcome.error, Some(SignatureError::NoSecret));
    }

    #[test]
    fn missing_header_is_reported() {
        let cfg = config(SignatureProvider::Github, "shh");
        let outcome = verify(&cfg, b"body", &HeaderMap::new(), 0);
        assert_eq!(outcome.error, Some(SignatureError::MissingHeader));
    }

    #[test]
    fn streaming_matches_eager_github() {
        let cfg = config(SignatureProvider::Github, "shh");
        let body = b"chunked-body";
        let sig = hmac_hex(b"shh", body).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", format!("sha256={sig}").parse().unwrap());

        let mut streamed = StreamVerifier::new(&cfg, &headers);
        streamed.update(&body[..4]);
        streamed.update(&body[4..]);
        let outcome = streamed.finalize();
        assert!(outcome.valid);
    }
}
