//! Response hardening headers.
//!
//! Sealed replies and bootstrap keys must never be cached or framed, so every
//! response also carries `Cache-Control: no-store` regardless of configuration.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{
        header::{
            CACHE_CONTROL, CONTENT_SECURITY_POLICY, REFERRER_POLICY, STRICT_TRANSPORT_SECURITY,
            X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
        },
        HeaderMap, HeaderName, HeaderValue,
    },
    middleware::Next,
    response::Response,
    Extension,
};

use crate::config::SecurityHeadersConfig;

/// Build the header set once at startup; it is shared through an `Extension`.
#[must_use]
pub fn build_security_headers(config: &SecurityHeadersConfig) -> Arc<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    let configured: [(HeaderName, &str); 3] = [
        (X_FRAME_OPTIONS, config.frame_options.as_str()),
        (CONTENT_SECURITY_POLICY, config.content_security_policy.as_str()),
        (REFERRER_POLICY, config.referrer_policy.as_str()),
    ];
    for (name, raw) in configured {
        match HeaderValue::from_str(raw) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = %name, "ignoring invalid security header value"),
        }
    }

    // HSTS only makes sense behind TLS
    if config.hsts_enabled {
        let mut hsts = format!("max-age={}", config.hsts_max_age);
        if config.hsts_include_subdomains {
            hsts.push_str("; includeSubDomains");
        }
        if let Ok(value) = HeaderValue::from_str(&hsts) {
            headers.insert(STRICT_TRANSPORT_SECURITY, value);
        }
    }

    Arc::new(headers)
}

/// Copy the prebuilt headers onto every response.
///
/// # Example
///
/// ```ignore
/// use axum::{middleware, Router, Extension};
/// use vaultkeep_api::http::security::{build_security_headers, security_headers_middleware};
/// use vaultkeep_api::config::SecurityHeadersConfig;
///
/// let headers = build_security_headers(&SecurityHeadersConfig::default());
/// let app = Router::new()
///     .layer(middleware::from_fn(security_headers_middleware))
///     .layer(Extension(headers));
/// ```
pub async fn security_headers_middleware(
    Extension(headers): Extension<Arc<HeaderMap>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let response_headers = response.headers_mut();
    for (k, v) in headers.iter() {
        response_headers.insert(k.clone(), v.clone());
    }
    response
}
