//! Authorization middleware.
//!
//! Resolves the bearer token into a typed [`Principal`] once per request
//! and stores it in the request extensions; handlers receive it as an
//! `Extension` argument. Repeated authorization failures are logged at
//! `WARN` no more than once per window so a misconfigured client cannot
//! flood the orchestrator's own log.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use helm_core::auth::Principal;
use tracing::{debug, warn};

use super::error::ApiError;
use crate::state::SharedState;

/// Minimum spacing between `WARN`-level auth-failure log lines.
const AUTH_WARN_WINDOW: Duration = Duration::from_secs(10);

static LAST_AUTH_WARN: Mutex<Option<Instant>> = Mutex::new(None);

/// Require a valid bearer token; insert the resolved [`Principal`] into
/// the request extensions.
pub async fn require_auth(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or_else(|| {
        note_auth_failure("missing bearer token");
        ApiError::Unauthorized("missing bearer token".to_string())
    })?;

    let principal = match state.verifier.verify(&token).await {
        Ok(principal) => principal,
        Err(err) => {
            note_auth_failure(&err.to_string());
            return Err(err.into());
        }
    };

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Gate for mutating endpoints: admin users pass, service tokens bypass.
///
/// # Errors
///
/// Returns [`ApiError::Forbidden`] for authenticated non-admin users.
pub fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.may_mutate() {
        Ok(())
    } else {
        debug!(caller = %principal.describe(), "privilege gate rejected caller");
        Err(ApiError::Forbidden)
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Auth failures are expected noise; only repeated ones deserve `WARN`.
fn note_auth_failure(reason: &str) {
    let mut last = LAST_AUTH_WARN.lock().expect("auth warn lock poisoned");
    let now = Instant::now();
    match *last {
        Some(at) if now.duration_since(at) < AUTH_WARN_WINDOW => {
            debug!("authorization failed: {reason}");
        }
        _ => {
            warn!("authorization failed: {reason}");
            *last = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use helm_core::auth::{PermissionLevel, ServicePrincipal, UserPrincipal};

    use super::*;

    fn user(level: PermissionLevel) -> Principal {
        Principal::User(UserPrincipal {
            sub: "u".to_string(),
            level,
            groups: vec![],
            jti: "j".to_string(),
        })
    }

    #[test]
    fn test_admin_gate() {
        assert!(require_admin(&user(PermissionLevel::Admin)).is_ok());
        assert!(matches!(
            require_admin(&user(PermissionLevel::Technician)),
            Err(ApiError::Forbidden)
        ));
        assert!(
            require_admin(&Principal::Service(ServicePrincipal {
                calling_service: "billing".to_string(),
            }))
            .is_ok()
        );
    }

    #[test]
    fn test_bearer_token_extraction() {
        let request = Request::builder()
            .header(header::AUTHORIZATION, "Bearer abc.def.ghi")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request).as_deref(), Some("abc.def.ghi"));

        let request = Request::builder()
            .header(header::AUTHORIZATION, "Basic dXNlcg==")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request), None);
    }
}
