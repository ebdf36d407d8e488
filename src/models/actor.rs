use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::Capability;

/// Identity vouched for by the auth collaborator. Trusted as given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Capability,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Capability) -> Self {
        Self { user_id, role }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Capability::Admin
    }

    pub fn require(&self, role: Capability) -> Result<(), AppError> {
        if self.role == role || self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("{role} role required")))
        }
    }

    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("admin access required".to_string()))
        }
    }
}
