//! Signed cookie carrying the visitor's seen-set between requests.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::http::header::COOKIE;
use axum::http::{HeaderMap, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pants_core::{InquestId, SeenSet};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

pub const SESSION_COOKIE: &str = "_pants_or_not_session";
pub const MIN_SECRET_LEN: usize = 32;
/// Longest `Set-Cookie` value emitted; browsers drop cookies past roughly 4096 bytes.
pub const MAX_COOKIE_LEN: usize = 4000;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionPayload {
    #[serde(default)]
    ruled_on: SeenSet,
}

/// Encodes and verifies `b64(payload).b64(hmac-sha256(payload))` cookie values
/// (unpadded URL-safe base64).
#[derive(Clone)]
pub struct SessionCodec {
    key: Arc<[u8]>,
    secure: bool,
}

impl fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCodec").field("secure", &self.secure).finish_non_exhaustive()
    }
}

impl SessionCodec {
    /// # Errors
    /// Returns an error when `secret` is shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn new(secret: &[u8], secure: bool) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(anyhow!("session secret MUST be at least {MIN_SECRET_LEN} bytes"));
        }
        Ok(Self { key: Arc::from(secret), secure })
    }

    /// A codec with a random per-process key; cookies die with the process.
    #[must_use]
    pub fn ephemeral(secure: bool) -> Self {
        let mut key = [0_u8; MIN_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key: Arc::from(&key[..]), secure }
    }

    /// Seen-set from the request's session cookie; empty when absent or invalid.
    #[must_use]
    pub fn read(&self, headers: &HeaderMap) -> SeenSet {
        let Some(value) = find_cookie(headers, SESSION_COOKIE) else {
            return SeenSet::new();
        };
        match self.decode_value(value) {
            Ok(seen) => seen,
            Err(err) => {
                warn!(error = %err, "discarding invalid session cookie");
                SeenSet::new()
            }
        }
    }

    /// `Set-Cookie` header value carrying `seen`, together with the number of ids
    /// forgotten to stay under [`MAX_COOKIE_LEN`].
    ///
    /// Over the limit, the lowest ids are dropped from `seen` first; `latest` is
    /// always kept.
    ///
    /// # Errors
    /// Returns an error when the payload cannot be serialized or signed, or when
    /// even `latest` alone does not fit.
    pub fn set_cookie(&self, seen: &mut SeenSet, latest: InquestId) -> Result<(HeaderValue, usize)> {
        let mut forgotten = 0;
        loop {
            let cookie = self.cookie_line(seen)?;
            if cookie.len() <= MAX_COOKIE_LEN {
                let header = HeaderValue::from_str(&cookie)
                    .context("session cookie is not a valid header value")?;
                return Ok((header, forgotten));
            }

            // Average encoded bytes per id; lowest ids are the shortest to encode.
            let per_id = (cookie.len() / seen.len().max(1)).max(1);
            let excess = (cookie.len() - MAX_COOKIE_LEN).div_ceil(per_id);
            for _ in 0..excess {
                if seen.forget_lowest_except(latest).is_none() {
                    return Err(anyhow!("session cookie exceeds {MAX_COOKIE_LEN} bytes"));
                }
                forgotten += 1;
            }
        }
    }

    fn cookie_line(&self, seen: &SeenSet) -> Result<String> {
        let secure = if self.secure { "; Secure" } else { "" };
        Ok(format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax{secure}",
            self.encode_value(seen)?
        ))
    }

    /// # Errors
    /// Returns an error when the payload cannot be serialized or signed.
    pub fn encode_value(&self, seen: &SeenSet) -> Result<String> {
        let payload = serde_json::to_vec(&SessionPayload { ruled_on: seen.clone() })
            .context("failed to serialize session payload")?;
        let mut mac = self.mac()?;
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();
        Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(payload), URL_SAFE_NO_PAD.encode(signature)))
    }

    /// # Errors
    /// Returns an error when the value is malformed, the signature does not
    /// verify, or the payload is not a valid session.
    pub fn decode_value(&self, value: &str) -> Result<SeenSet> {
        let (payload_b64, signature_b64) =
            value.split_once('.').ok_or_else(|| anyhow!("session cookie has no signature"))?;
        let payload =
            URL_SAFE_NO_PAD.decode(payload_b64).context("session payload is not valid base64")?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .context("session signature is not valid base64")?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&signature).map_err(|_| anyhow!("session signature verification failed"))?;

        let session: SessionPayload =
            serde_json::from_slice(&payload).context("failed to parse session payload")?;
        Ok(session.ruled_on)
    }

    fn mac(&self) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|err| anyhow!("failed to initialize session key: {err}"))
    }
}

fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"a-test-secret-that-is-long-enough-for-hmac";

    fn codec() -> SessionCodec {
        match SessionCodec::new(SECRET, false) {
            Ok(codec) => codec,
            Err(err) => panic!("fixture secret rejected: {err}"),
        }
    }

    fn cookie_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(value) {
            Ok(header) => headers.insert(COOKIE, header),
            Err(err) => panic!("invalid cookie fixture: {err}"),
        };
        headers
    }

    #[test]
    fn encoded_seen_set_decodes_back() -> Result<()> {
        let codec = codec();
        let seen = [InquestId(4), InquestId(9)].into_iter().collect::<SeenSet>();
        let value = codec.encode_value(&seen)?;
        assert_eq!(codec.decode_value(&value)?, seen);
        Ok(())
    }

    #[test]
    fn tampered_payload_is_rejected() -> Result<()> {
        let codec = codec();
        let value = codec.encode_value(&SeenSet::new())?;
        let Some((_, signature)) = value.split_once('.') else {
            panic!("encoded value should contain a signature");
        };
        let forged = format!("{}.{signature}", URL_SAFE_NO_PAD.encode(br#"{"ruled_on":[1,2,3]}"#));
        assert!(codec.decode_value(&forged).is_err());
        Ok(())
    }

    #[test]
    fn cookie_signed_with_other_key_reads_as_empty() -> Result<()> {
        let other = SessionCodec::ephemeral(false);
        let seen = [InquestId(1)].into_iter().collect::<SeenSet>();
        let headers = cookie_headers(&format!("{SESSION_COOKIE}={}", other.encode_value(&seen)?));
        assert!(codec().read(&headers).is_empty());
        Ok(())
    }

    #[test]
    fn session_cookie_is_found_among_others() -> Result<()> {
        let codec = codec();
        let seen = [InquestId(2)].into_iter().collect::<SeenSet>();
        let headers = cookie_headers(&format!(
            "theme=dark; {SESSION_COOKIE}={}; other=1",
            codec.encode_value(&seen)?
        ));
        assert_eq!(codec.read(&headers), seen);
        assert!(codec.read(&HeaderMap::new()).is_empty());
        Ok(())
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(SessionCodec::new(b"too-short", false).is_err());
    }

    #[test]
    fn set_cookie_carries_attributes() -> Result<()> {
        let secure = SessionCodec::new(SECRET, true)?;
        let mut seen = [InquestId(1)].into_iter().collect::<SeenSet>();
        let (header, forgotten) = secure.set_cookie(&mut seen, InquestId(1))?;
        let value = header.to_str()?;
        assert!(value.starts_with(&format!("{SESSION_COOKIE}=")));
        assert!(value.contains("HttpOnly"));
        assert!(value.ends_with("; Secure"));
        assert_eq!(forgotten, 0);
        Ok(())
    }

    #[test]
    fn four_hundred_rulings_fit_without_forgetting() -> Result<()> {
        let codec = codec();
        let mut seen = (1..=400).map(InquestId).collect::<SeenSet>();
        let (header, forgotten) = codec.set_cookie(&mut seen, InquestId(400))?;
        assert!(header.as_bytes().len() <= MAX_COOKIE_LEN);
        assert_eq!(forgotten, 0);
        assert_eq!(seen.len(), 400);
        Ok(())
    }

    #[test]
    fn oversized_seen_set_forgets_lowest_ids_but_keeps_latest() -> Result<()> {
        let codec = codec();
        let latest = InquestId(3);
        let mut seen = (1_000_000..1_002_000).map(InquestId).collect::<SeenSet>();
        seen.mark_seen(latest);

        let (header, forgotten) = codec.set_cookie(&mut seen, latest)?;
        assert!(header.as_bytes().len() <= MAX_COOKIE_LEN);
        assert!(forgotten > 0);
        assert_eq!(seen.len(), 2_001 - forgotten);
        assert!(seen.contains(latest));
        assert!(!seen.contains(InquestId(1_000_000)));
        assert!(seen.contains(InquestId(1_001_999)));

        let Some(value) = header.to_str()?.split(';').next() else {
            panic!("cookie header should carry a name=value pair");
        };
        let headers = cookie_headers(value);
        assert_eq!(codec.read(&headers), seen);
        Ok(())
    }
}
