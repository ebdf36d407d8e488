use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::user::{Capability, User};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", post(register_user))
        .route("/users/me", get(me))
}

#[derive(Deserialize)]
pub struct RegisterUserRequest {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Serialize)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: User,
    pub role: Capability,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        let role = user.primary_role();
        Self { user, role }
    }
}

/// Stores the profile for an identity the auth layer already issued. Driver
/// capability is only granted through taxi approval.
async fn register_user(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<UserProfile>), AppError> {
    let name = payload.name.trim().to_string();
    let email = payload.email.trim().to_ascii_lowercase();

    if name.is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if !email.contains('@') {
        return Err(AppError::Validation("email is not valid".to_string()));
    }

    let user = state.store.transact(|tx| {
        if tx.get::<User>(actor.user_id).is_some() {
            return Err(AppError::Conflict(format!(
                "user {} is already registered",
                actor.user_id
            )));
        }
        if !tx.scan(|user: &User| user.email == email).is_empty() {
            return Err(AppError::Conflict(format!("email {email} is already in use")));
        }

        let mut user = User::new(name.clone(), email.clone(), payload.phone.clone());
        user.id = actor.user_id;
        if actor.is_admin() {
            user.capabilities.insert(Capability::Admin);
        }
        tx.put(user.clone());
        Ok(user)
    })?;

    info!(user_id = %user.id, "user registered");
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn me(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<UserProfile>, AppError> {
    let user = state
        .store
        .user(actor.user_id)
        .ok_or_else(|| AppError::NotFound(format!("user {} not found", actor.user_id)))?;

    Ok(Json(user.into()))
}
