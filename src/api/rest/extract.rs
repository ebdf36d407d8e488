use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::user::Capability;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Identity forwarded by the auth layer in front of this service.
#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header(parts, USER_ID_HEADER)?
            .parse::<Uuid>()
            .map_err(|err| AppError::Unauthenticated(format!("invalid {USER_ID_HEADER}: {err}")))?;

        let role = header(parts, USER_ROLE_HEADER)?
            .parse::<Capability>()
            .map_err(AppError::Unauthenticated)?;

        Ok(Actor::new(user_id, role))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .ok_or_else(|| AppError::Unauthenticated(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| AppError::Unauthenticated(format!("{name} header is not valid text")))
}
