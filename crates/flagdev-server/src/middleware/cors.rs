use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::CorsConfig;

/// CORS for the browser-facing route groups. None when disabled.
pub fn cors_layer(config: &CorsConfig) -> Option<CorsLayer> {
    if !config.enabled {
        return None;
    }

    let origin = if config.allowed_origin == "*" {
        AllowOrigin::any()
    } else {
        match HeaderValue::from_str(&config.allowed_origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!(
                    origin = %config.allowed_origin,
                    "Invalid CORS origin, allowing any origin"
                );
                AllowOrigin::any()
            }
        }
    };

    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ]
    .into_iter()
    .chain(Method::from_bytes(b"REPORT").ok())
    .collect::<Vec<_>>();

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(methods)
            .allow_headers(Any)
            .expose_headers([header::CONTENT_TYPE]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled() {
        let config = CorsConfig {
            enabled: false,
            allowed_origin: "*".to_string(),
        };
        assert!(cors_layer(&config).is_none());
    }

    #[test]
    fn test_enabled_with_origin() {
        let config = CorsConfig {
            enabled: true,
            allowed_origin: "http://localhost:3000".to_string(),
        };
        assert!(cors_layer(&config).is_some());
    }
}
