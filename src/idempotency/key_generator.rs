use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{AppError, Result};

/// Composite idempotency key: `<tenant>:<operation>:<hash>`.
///
/// Tenant and operation never contain `:`, so the text form splits back into
/// the same three parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    tenant: String,
    operation: String,
    content_hash: String,
}

impl IdempotencyKey {
    pub fn new(
        tenant: impl Into<String>,
        operation: impl Into<String>,
        content_hash: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            tenant: tenant.into(),
            operation: operation.into(),
            content_hash: content_hash.into(),
        };

        if key.tenant.trim().is_empty() {
            return Err(AppError::Validation("tenant cannot be empty".to_string()));
        }
        if key.operation.trim().is_empty() {
            return Err(AppError::Validation("operation cannot be empty".to_string()));
        }
        if key.content_hash.trim().is_empty() {
            return Err(AppError::Validation("content hash cannot be empty".to_string()));
        }
        if key.tenant.contains(':') || key.operation.contains(':') {
            return Err(AppError::Validation(
                "tenant and operation cannot contain ':'".to_string(),
            ));
        }

        Ok(key)
    }

    /// Parses the canonical `<tenant>:<operation>:<hash>` form.
    pub fn parse(value: &str) -> Result<Self> {
        let mut parts = value.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(operation), Some(hash)) => Self::new(tenant, operation, hash),
            _ => Err(AppError::Validation(format!(
                "malformed idempotency key '{}', expected <tenant>:<operation>:<hash>",
                value
            ))),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant, self.operation, self.content_hash)
    }
}

/// Configuration for request fingerprinting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyGeneratorConfig {
    /// Canonicalize JSON bodies so key order and whitespace don't change the hash.
    pub canonicalize_json: bool,
}

impl Default for KeyGeneratorConfig {
    fn default() -> Self {
        Self {
            canonicalize_json: true,
        }
    }
}

/// The parts of an inbound request that identify a submission.
#[derive(Debug, Clone)]
pub struct RequestParts<'a> {
    pub tenant_id: &'a str,
    pub product_code: Option<&'a str>,
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    pub client_key: Option<&'a str>,
}

/// Key plus the hash of the full request, stored alongside the record so a
/// reused client key with a different payload can be rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub key: IdempotencyKey,
    pub request_hash: String,
}

/// Derives idempotency keys from inbound requests using SHA-256.
#[derive(Debug, Clone, Default)]
pub struct RequestFingerprinter {
    config: KeyGeneratorConfig,
}

impl RequestFingerprinter {
    pub fn new(config: KeyGeneratorConfig) -> Self {
        Self { config }
    }

    pub fn with_default_config() -> Self {
        Self::new(KeyGeneratorConfig::default())
    }

    /// Fingerprints a request.
    ///
    /// With a client-supplied key the content hash is the digest of that key,
    /// so retries with a byte-different body still map to the same record.
    /// Without one the content hash is the request hash itself.
    pub fn fingerprint(&self, parts: &RequestParts<'_>) -> Result<RequestFingerprint> {
        let tenant = Self::tenant_scope(parts.tenant_id, parts.product_code)?;
        let operation = Self::operation_id(parts.method, parts.path);
        let request_hash = self.request_hash(parts.method, parts.path, parts.body);

        let content_hash = match parts.client_key.map(str::trim) {
            Some(client_key) if !client_key.is_empty() => Self::hash_client_key(client_key),
            Some(_) => {
                return Err(AppError::Validation(
                    "idempotency key header cannot be empty".to_string(),
                ))
            }
            None => request_hash.clone(),
        };

        Ok(RequestFingerprint {
            key: IdempotencyKey::new(tenant, operation, content_hash)?,
            request_hash,
        })
    }

    /// Hash of method, path and (canonicalized) body.
    pub fn request_hash(&self, method: &str, path: &str, body: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b"|");
        hasher.update(path.as_bytes());
        hasher.update(b"|");
        hasher.update(&self.body_digest(body));
        hex::encode(hasher.finalize())
    }

    /// Normalizes a client-provided idempotency key.
    pub fn hash_client_key(client_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(client_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn body_digest(&self, body: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        if self.config.canonicalize_json && !body.is_empty() {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
                // serde_json's default map is ordered, so re-serializing sorts keys.
                if let Ok(canonical) = serde_json::to_vec(&value) {
                    hasher.update(&canonical);
                    return hasher.finalize().to_vec();
                }
            }
        }
        hasher.update(body);
        hasher.finalize().to_vec()
    }

    /// `<tenant>[/<product>]` with both parts percent-escaped, so no tenant
    /// name can spell another tenant's product scope.
    pub fn tenant_scope(tenant_id: &str, product_code: Option<&str>) -> Result<String> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Err(AppError::Validation("tenant header cannot be empty".to_string()));
        }

        Ok(match product_code.map(str::trim).filter(|p| !p.is_empty()) {
            Some(product) => format!("{}/{}", escape_scope(tenant_id), escape_scope(product)),
            None => escape_scope(tenant_id),
        })
    }

    fn operation_id(method: &str, path: &str) -> String {
        format!("{} {}", method.to_ascii_uppercase(), escape_path(path))
    }
}

fn escape_path(value: &str) -> String {
    value.replace('%', "%25").replace(':', "%3A")
}

fn escape_scope(value: &str) -> String {
    escape_path(value).replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(body: &'a [u8], client_key: Option<&'a str>) -> RequestParts<'a> {
        RequestParts {
            tenant_id: "tenant1",
            product_code: None,
            method: "POST",
            path: "/contracts",
            body,
            client_key,
        }
    }

    #[test]
    fn test_key_display_and_parse() {
        let key = IdempotencyKey::new("tenant1", "create-contract", "hash123").unwrap();
        assert_eq!(key.to_string(), "tenant1:create-contract:hash123");

        let parsed = IdempotencyKey::parse("tenant1:create-contract:hash123").unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.tenant(), "tenant1");
        assert_eq!(parsed.operation(), "create-contract");
        assert_eq!(parsed.content_hash(), "hash123");
    }

    #[test]
    fn test_parse_keeps_colons_in_hash() {
        let parsed = IdempotencyKey::parse("t:op:a:b").unwrap();
        assert_eq!(parsed.content_hash(), "a:b");
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(IdempotencyKey::parse("tenant1:only-two").is_err());
        assert!(IdempotencyKey::parse("::").is_err());
        assert!(IdempotencyKey::new("ten:ant", "op", "h").is_err());
    }

    #[test]
    fn test_fingerprint_consistency() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let a = fingerprinter.fingerprint(&parts(br#"{"name":"NDA"}"#, None)).unwrap();
        let b = fingerprinter.fingerprint(&parts(br#"{"name":"NDA"}"#, None)).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.key.tenant(), "tenant1");
        assert_eq!(a.key.operation(), "POST /contracts");
        assert_eq!(a.key.content_hash(), a.request_hash);
    }

    #[test]
    fn test_json_canonicalization() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let a = fingerprinter
            .fingerprint(&parts(br#"{"name":"NDA","value":10}"#, None))
            .unwrap();
        let b = fingerprinter
            .fingerprint(&parts(br#"{ "value": 10, "name": "NDA" }"#, None))
            .unwrap();
        assert_eq!(a.key, b.key);

        let raw = RequestFingerprinter::new(KeyGeneratorConfig {
            canonicalize_json: false,
        });
        let a = raw.fingerprint(&parts(br#"{"name":"NDA","value":10}"#, None)).unwrap();
        let b = raw.fingerprint(&parts(br#"{ "value": 10, "name": "NDA" }"#, None)).unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_different_bodies_different_keys() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let a = fingerprinter.fingerprint(&parts(br#"{"amount":100}"#, None)).unwrap();
        let b = fingerprinter.fingerprint(&parts(br#"{"amount":200}"#, None)).unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_client_key_ignores_body_in_key() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let a = fingerprinter
            .fingerprint(&parts(br#"{"amount":100}"#, Some("req-42")))
            .unwrap();
        let b = fingerprinter
            .fingerprint(&parts(br#"{"amount":200}"#, Some("req-42")))
            .unwrap();

        assert_eq!(a.key, b.key);
        assert_ne!(a.request_hash, b.request_hash);
        assert_eq!(a.key.content_hash(), RequestFingerprinter::hash_client_key("req-42"));
    }

    #[test]
    fn test_blank_client_key_rejected() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        assert!(fingerprinter.fingerprint(&parts(b"", Some("  "))).is_err());
    }

    #[test]
    fn test_product_scopes_tenant() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let mut with_product = parts(b"{}", None);
        with_product.product_code = Some("contractnest");
        let scoped = fingerprinter.fingerprint(&with_product).unwrap();
        let plain = fingerprinter.fingerprint(&parts(b"{}", None)).unwrap();

        assert_eq!(scoped.key.tenant(), "tenant1/contractnest");
        assert_ne!(scoped.key, plain.key);
    }

    #[test]
    fn test_slash_in_tenant_cannot_forge_product_scope() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let mut scoped = parts(b"{}", None);
        scoped.tenant_id = "acme";
        scoped.product_code = Some("contractnest");
        let mut slashed = parts(b"{}", None);
        slashed.tenant_id = "acme/contractnest";

        let scoped = fingerprinter.fingerprint(&scoped).unwrap();
        let slashed = fingerprinter.fingerprint(&slashed).unwrap();

        assert_eq!(scoped.key.tenant(), "acme/contractnest");
        assert_eq!(slashed.key.tenant(), "acme%2Fcontractnest");
        assert_ne!(scoped.key, slashed.key);
    }

    #[test]
    fn test_scope_escaping_is_unambiguous() {
        let colon = RequestFingerprinter::tenant_scope("a:b", None).unwrap();
        let literal = RequestFingerprinter::tenant_scope("a%3Ab", None).unwrap();
        assert_eq!(colon, "a%3Ab");
        assert_eq!(literal, "a%253Ab");
    }

    #[test]
    fn test_colon_in_path_is_escaped() {
        let fingerprinter = RequestFingerprinter::with_default_config();
        let mut request = parts(b"", None);
        request.path = "/contracts/a:b";
        let fp = fingerprinter.fingerprint(&request).unwrap();
        assert_eq!(fp.key.operation(), "POST /contracts/a%3Ab");
        assert_eq!(IdempotencyKey::parse(&fp.key.to_string()).unwrap(), fp.key);
    }
}
