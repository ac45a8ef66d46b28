//! Object storage presigning.
//!
//! Video blobs live in an S3-compatible store. The pipeline never talks to
//! the store directly; it receives a presigned GET URL whose expiry covers a
//! full run, and the upload flow hands clients a shorter-lived presigned PUT
//! URL. Presigning is pure string and HMAC work (SigV4 query signing), no
//! network I/O.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::ObjectStoreSettings;

type HmacSha256 = Hmac<Sha256>;

/// GET expiry covering one full pipeline run.
pub const GET_URL_EXPIRY_SECS: u64 = 3600;
/// PUT expiry for the upload flow.
pub const PUT_URL_EXPIRY_SECS: u64 = 600;

pub trait ObjectStore: Send + Sync {
    fn presigned_get_url(&self, bucket: &str, key: &str, expires_secs: u64) -> Result<String>;
    fn presigned_put_url(&self, bucket: &str, key: &str, expires_secs: u64) -> Result<String>;
}

/// SigV4 query-string presigner for S3-compatible endpoints (path-style).
pub struct S3Presigner {
    endpoint: Url,
    region: String,
    access_key_id: String,
    secret_access_key: String,
}

impl S3Presigner {
    pub fn new(settings: &ObjectStoreSettings) -> Result<Self> {
        let endpoint = Url::parse(&settings.endpoint)
            .map_err(|e| anyhow!("invalid object store endpoint: {}", e))?;
        if endpoint.host_str().is_none() {
            return Err(anyhow!("object store endpoint has no host"));
        }
        Ok(Self {
            endpoint,
            region: settings.region.clone(),
            access_key_id: settings.access_key_id.clone(),
            secret_access_key: settings.secret_access_key.clone(),
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Presign with an explicit signing time, so tests can pin the clock.
    pub fn presign_at(
        &self,
        method: &str,
        bucket: &str,
        key: &str,
        expires_secs: u64,
        when: DateTime<Utc>,
    ) -> Result<String> {
        let amz_date = when.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = when.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", datestamp, self.region);
        let credential = format!("{}/{}", self.access_key_id, scope);
        let host = self.host();

        let canonical_uri = format!(
            "/{}/{}",
            uri_encode(bucket, false),
            uri_encode(key, true)
        );

        // Sorted by parameter name, as the canonical form requires.
        let canonical_query = [
            ("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential", credential),
            ("X-Amz-Date", amz_date.clone()),
            ("X-Amz-Expires", expires_secs.to_string()),
            ("X-Amz-SignedHeaders", "host".to_string()),
        ]
        .iter()
        .map(|(name, value)| format!("{}={}", name, uri_encode(value, false)))
        .collect::<Vec<_>>()
        .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            method, canonical_uri, canonical_query, host
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut key_bytes = hmac_sha256(
            format!("AWS4{}", self.secret_access_key).as_bytes(),
            datestamp.as_bytes(),
        )?;
        for part in [self.region.as_bytes(), b"s3", b"aws4_request"] {
            key_bytes = hmac_sha256(&key_bytes, part)?;
        }
        let signature = hex::encode(hmac_sha256(&key_bytes, string_to_sign.as_bytes())?);

        Ok(format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            self.endpoint.scheme(),
            host,
            canonical_uri,
            canonical_query,
            signature
        ))
    }
}

impl ObjectStore for S3Presigner {
    fn presigned_get_url(&self, bucket: &str, key: &str, expires_secs: u64) -> Result<String> {
        self.presign_at("GET", bucket, key, expires_secs, Utc::now())
    }

    fn presigned_put_url(&self, bucket: &str, key: &str, expires_secs: u64) -> Result<String> {
        self.presign_at("PUT", bucket, key, expires_secs, Utc::now())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| anyhow!("hmac key of invalid length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// SigV4 URI encoding: RFC 3986 unreserved characters pass through, `/` is
/// preserved only when encoding an object key path.
fn uri_encode(value: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presigner() -> S3Presigner {
        S3Presigner::new(&ObjectStoreSettings {
            endpoint: "http://127.0.0.1:9000".to_string(),
            region: "us-east-1".to_string(),
            bucket: "spotter-files".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
        })
        .expect("presigner")
    }

    fn pinned_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-15T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn presigned_url_carries_the_signing_query() {
        let url = presigner()
            .presign_at("GET", "spotter-files", "abc123", 3600, pinned_time())
            .expect("presign");
        let parsed = Url::parse(&url).expect("parse");

        assert_eq!(parsed.scheme(), "http");
        assert_eq!(parsed.host_str(), Some("127.0.0.1"));
        assert_eq!(parsed.port(), Some(9000));
        assert_eq!(parsed.path(), "/spotter-files/abc123");

        let query: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(
            query.get("X-Amz-Algorithm").map(|v| v.as_ref()),
            Some("AWS4-HMAC-SHA256")
        );
        assert_eq!(
            query.get("X-Amz-Credential").map(|v| v.as_ref()),
            Some("AKIDEXAMPLE/20260115/us-east-1/s3/aws4_request")
        );
        assert_eq!(query.get("X-Amz-Date").map(|v| v.as_ref()), Some("20260115T100000Z"));
        assert_eq!(query.get("X-Amz-Expires").map(|v| v.as_ref()), Some("3600"));
        assert_eq!(query.get("X-Amz-SignedHeaders").map(|v| v.as_ref()), Some("host"));
        let signature = query.get("X-Amz-Signature").expect("signature");
        assert_eq!(signature.len(), 64);
        assert!(signature.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn presigning_is_deterministic_for_a_pinned_clock() {
        let a = presigner()
            .presign_at("GET", "spotter-files", "abc123", 3600, pinned_time())
            .expect("presign");
        let b = presigner()
            .presign_at("GET", "spotter-files", "abc123", 3600, pinned_time())
            .expect("presign");
        assert_eq!(a, b);
    }

    #[test]
    fn method_and_expiry_change_the_signature() {
        let get = presigner()
            .presign_at("GET", "spotter-files", "abc123", 3600, pinned_time())
            .expect("presign");
        let put = presigner()
            .presign_at("PUT", "spotter-files", "abc123", 600, pinned_time())
            .expect("presign");
        assert_ne!(get, put);
    }
}
