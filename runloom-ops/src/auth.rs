use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;

use crate::{ApiError, OpsState};

/// Header carrying the shared API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// One accepted API key. The id (not the secret) lands in the audit log.
#[derive(Clone, Debug)]
pub struct ApiKey {
    pub id: String,
    pub secret: String,
}

impl ApiKey {
    #[must_use]
    pub fn new(id: &str, secret: &str) -> Self {
        Self {
            id: id.to_string(),
            secret: secret.to_string(),
        }
    }
}

/// The authenticated caller's key id, inserted into request extensions.
#[derive(Clone, Debug)]
pub struct ActorKey(pub String);

pub async fn require_api_key(
    State(state): State<OpsState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(key) = state.api_keys.iter().find(|k| k.secret == presented) else {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "missing or invalid api key",
        ));
    };
    request.extensions_mut().insert(ActorKey(key.id.clone()));
    Ok(next.run(request).await)
}
