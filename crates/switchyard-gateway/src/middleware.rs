use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Auth configuration for the status endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API keys that are allowed in. Empty = no auth required.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Creates a config accepting the given keys.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

/// The verified caller, attached to the request by [`auth_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Auth is disabled.
    Anonymous,
    /// Caller presented a configured key; holds its index in the key list.
    ApiKey(usize),
}

/// Query-string fallback for the API key.
#[derive(Deserialize, Default)]
pub struct AuthQuery {
    /// Value of `?api_key=`.
    pub api_key: Option<String>,
}

/// Auth middleware: validates API key from header or query param.
///
/// Checks `Authorization: Bearer <key>` header first, then `?api_key=<key>`.
/// On success the resolved [`Principal`] is inserted as a request extension.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    mut request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        request.extensions_mut().insert(Principal::Anonymous);
        return next.run(request).await;
    }

    let key_from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let key = key_from_header.or_else(|| query.api_key.clone());

    match key {
        Some(k) => match auth.api_keys.iter().position(|allowed| *allowed == k) {
            Some(idx) => {
                request.extensions_mut().insert(Principal::ApiKey(idx));
                next.run(request).await
            }
            None => {
                warn!("Rejected request: invalid API key");
                (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
            }
        },
        None => {
            warn!("Rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware as axum_mw, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn whoami(Extension(principal): Extension<Principal>) -> String {
        format!("{principal:?}")
    }

    fn app(keys: &[&str]) -> Router {
        let auth = Arc::new(AuthConfig::new(keys.iter().map(|k| k.to_string()).collect()));
        Router::new()
            .route("/whoami", get(whoami))
            .route_layer(axum_mw::from_fn_with_state(auth, auth_middleware))
    }

    async fn call(app: Router, uri: &str, bearer: Option<&str>) -> (StatusCode, String) {
        let mut req = axum::http::Request::builder().uri(uri);
        if let Some(key) = bearer {
            req = req.header("authorization", format!("Bearer {key}"));
        }
        let resp = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_auth_config_disabled() {
        let config = AuthConfig::new(vec![]);
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_auth_config_enabled() {
        let config = AuthConfig::new(vec!["key123".to_string()]);
        assert!(config.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_auth_is_anonymous() {
        let (status, body) = call(app(&[]), "/whoami", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Anonymous");
    }

    #[tokio::test]
    async fn test_header_and_query_keys() {
        let (status, body) = call(app(&["a", "b"]), "/whoami", Some("b")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ApiKey(1)");

        let (status, body) = call(app(&["a", "b"]), "/whoami?api_key=a", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ApiKey(0)");
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys_rejected() {
        let (status, body) = call(app(&["a"]), "/whoami", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "API key required");

        let (status, body) = call(app(&["a"]), "/whoami", Some("nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Invalid API key");
    }
}
