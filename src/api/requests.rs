use axum::http::HeaderMap;

use crate::api::responses::ValidationErrorDetail;
use crate::config::IdempotencySettings;

/// Tenant and idempotency headers of an inbound edge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeHeaders {
    pub tenant_id: Option<String>,
    pub product_code: Option<String>,
    pub client_key: Option<String>,
}

impl EdgeHeaders {
    pub fn from_headers(headers: &HeaderMap, settings: &IdempotencySettings) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        Self {
            tenant_id: read(&settings.tenant_header),
            product_code: read(&settings.product_header).filter(|v| !v.is_empty()),
            client_key: read(&settings.key_header),
        }
    }

    /// Headers required on guarded writes.
    pub fn validate(&self, settings: &IdempotencySettings) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        match self.tenant_id.as_deref() {
            None => errors.push(ValidationError::new(&settings.tenant_header, "header is required")),
            Some("") => errors.push(ValidationError::new(&settings.tenant_header, "header cannot be empty")),
            Some(_) => {}
        }
        if self.client_key.as_deref() == Some("") {
            errors.push(ValidationError::new(&settings.key_header, "header cannot be empty"));
        }
        if self.client_key.as_ref().is_some_and(|k| k.len() > 255) {
            errors.push(ValidationError::new(&settings.key_header, "header cannot exceed 255 characters"));
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<ValidationError> for ValidationErrorDetail {
    fn from(error: ValidationError) -> Self {
        Self {
            field: error.field,
            message: error.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_reads_configured_headers() {
        let settings = IdempotencySettings::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", HeaderValue::from_static(" tenant1 "));
        headers.insert("x-product-code", HeaderValue::from_static("contractnest"));
        headers.insert("idempotency-key", HeaderValue::from_static("req-1"));

        let edge = EdgeHeaders::from_headers(&headers, &settings);
        assert_eq!(edge.tenant_id.as_deref(), Some("tenant1"));
        assert_eq!(edge.product_code.as_deref(), Some("contractnest"));
        assert_eq!(edge.client_key.as_deref(), Some("req-1"));
        assert!(edge.validate(&settings).is_ok());
    }

    #[test]
    fn test_missing_tenant_fails_validation() {
        let settings = IdempotencySettings::default();
        let edge = EdgeHeaders::from_headers(&HeaderMap::new(), &settings);

        let errors = edge.validate(&settings).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "x-tenant-id");
    }

    #[test]
    fn test_blank_client_key_fails_validation() {
        let settings = IdempotencySettings::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant-id", HeaderValue::from_static("tenant1"));
        headers.insert("idempotency-key", HeaderValue::from_static("  "));

        let edge = EdgeHeaders::from_headers(&headers, &settings);
        let errors = edge.validate(&settings).unwrap_err();
        assert_eq!(errors[0].field, "idempotency-key");
    }
}
