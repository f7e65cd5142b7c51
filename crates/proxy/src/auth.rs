//! Basic authentication wrapper for endpoints.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reverse_exporter_config::AuthConfig;
use tracing::{debug, warn};

const CHALLENGE: &str = "Basic realm=\"reverse-exporter\"";

/// Static user to password-set map checked on every request.
pub struct BasicAuthValidator {
    users: HashMap<String, HashSet<String>>,
}

impl BasicAuthValidator {
    /// Builds the validator from configuration. Per the configuration
    /// contract, a credential with an empty password is ignored rather than
    /// allowing empty-password logins; returns `None` when nothing usable
    /// remains, in which case the endpoint is served without authentication.
    pub fn from_config(config: &AuthConfig) -> Option<Arc<Self>> {
        let mut users: HashMap<String, HashSet<String>> = HashMap::new();
        for credential in &config.basic_auth {
            if credential.password.is_empty() {
                warn!(user = %credential.username, "ignoring basic auth credential with empty password");
                continue;
            }
            users
                .entry(credential.username.clone())
                .or_default()
                .insert(credential.password.clone());
        }
        if users.is_empty() {
            return None;
        }
        Some(Arc::new(Self { users }))
    }

    /// Checks an `Authorization` header value, returning the authenticated
    /// username.
    pub fn authenticate(&self, header: &str) -> Option<String> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded.trim()).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (username, password) = credentials.split_once(':')?;
        let passwords = self.users.get(username)?;
        passwords
            .contains(password)
            .then(|| username.to_string())
    }
}

/// Axum middleware enforcing basic authentication. Rejections carry a
/// `WWW-Authenticate` challenge and never reach the inner handler.
pub async fn basic_auth_middleware(
    State(validator): State<Arc<BasicAuthValidator>>,
    request: Request,
    next: Next,
) -> Response {
    let authenticated = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| validator.authenticate(header));

    match authenticated {
        Some(user) => {
            debug!(user = %user, "authentication success");
            next.run(request).await
        }
        None => {
            debug!("authentication failed");
            Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(WWW_AUTHENTICATE, CHALLENGE)
                .body(Body::from("Unauthorized"))
                .unwrap_or_default()
        }
    }
}
