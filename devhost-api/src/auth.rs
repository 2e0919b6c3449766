use crate::error::ApiError;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use devhost_orchestrator::{InstanceManager, InstanceRecord};

/// Identity headers, most specific first.
const USER_HEADERS: [&str; 3] = ["x-devhost-user", "x-forwarded-user", "x-user"];

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub username: String,
}

/// Auth middleware: takes the caller's identity from the headers set by the
/// authenticating proxy in front of the service.
///
/// `x-user` is accepted for local development without a proxy.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = USER_HEADERS
        .iter()
        .find_map(|name| req.headers().get(*name))
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthenticatedUser { username });

    Ok(next.run(req).await)
}

/// Load an instance on behalf of `user`.
///
/// - `ApiError::NotFound` if the instance doesn't exist
/// - `ApiError::Forbidden` if it belongs to someone else
pub async fn owned_instance(
    manager: &InstanceManager,
    instance_id: &str,
    user: &AuthenticatedUser,
) -> Result<InstanceRecord, ApiError> {
    let record = manager.get_instance(instance_id).await?;
    ensure_owner(&record, user)?;
    Ok(record)
}

pub fn ensure_owner(record: &InstanceRecord, user: &AuthenticatedUser) -> Result<(), ApiError> {
    if record.user_id != user.username {
        return Err(ApiError::Forbidden(format!(
            "Access denied: instance {} belongs to another user",
            record.instance_id
        )));
    }
    Ok(())
}
