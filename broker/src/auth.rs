//! HMAC-SHA256 request signing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-API-KEY";
pub const SIGNATURE_HEADER: &str = "X-API-SIGNATURE";
pub const TIMESTAMP_HEADER: &str = "X-API-TIMESTAMP";

/// Canonical string covered by the signature: `METHOD + path_and_query + timestamp + body`.
pub fn canonical_string(method: &str, path_and_query: &str, timestamp_ms: i64, body: &str) -> String {
    let mut s = String::with_capacity(method.len() + path_and_query.len() + body.len() + 13);
    s.push_str(&method.to_ascii_uppercase());
    s.push_str(path_and_query);
    s.push_str(&timestamp_ms.to_string());
    s.push_str(body);
    s
}

/// Sign `message` with HMAC-SHA256, hex-encoded.
pub fn sign(message: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Header values for one signed request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedHeaders {
    pub api_key: String,
    pub signature: String,
    pub timestamp: String,
}

impl SignedHeaders {
    pub fn new(
        api_key: &str,
        secret: &[u8],
        method: &str,
        path_and_query: &str,
        timestamp_ms: i64,
        body: &str,
    ) -> Self {
        let canonical = canonical_string(method, path_and_query, timestamp_ms, body);
        Self {
            api_key: api_key.to_string(),
            signature: sign(&canonical, secret),
            timestamp: timestamp_ms.to_string(),
        }
    }

    /// `(name, value)` pairs in send order.
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            (API_KEY_HEADER, &self.api_key),
            (SIGNATURE_HEADER, &self.signature),
            (TIMESTAMP_HEADER, &self.timestamp),
        ]
    }
}
