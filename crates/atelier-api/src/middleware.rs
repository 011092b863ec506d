use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USERNAME_HEADER: &str = "x-username";

/// Caller identity as asserted by the fronting auth layer.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: Option<String>,
}

impl Identity {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Uuid>().ok())?;
        let username = headers
            .get(USERNAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Some(Self { user_id, username })
    }
}

/// Extract the caller identity from request headers.
///
/// Authentication happens upstream; this only refuses requests that arrive
/// without an identity.
pub async fn require_identity(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let identity = Identity::from_headers(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
