/// JWT Claims structure
///
/// Payload shared by access and refresh tokens. Refresh tokens always carry
/// a `jti`; access tokens never do.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AuthError};
use crate::users::Role;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    pub email: String,
    pub roles: Vec<Role>,
    /// Unique token identifier, refresh tokens only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub iss: String,
}

impl Claims {
    pub fn new(
        user_id: Uuid,
        email: &str,
        roles: &[Role],
        jti: Option<String>,
        expiry_seconds: i64,
        issuer: &str,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user_id.to_string(),
            email: email.to_string(),
            roles: roles.to_vec(),
            jti,
            exp: now + expiry_seconds,
            iat: now,
            iss: issuer.to_string(),
        }
    }

    /// Extract user ID from claims
    ///
    /// # Errors
    /// A `sub` that is not a UUID is treated as an invalid token
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Auth(AuthError::TokenInvalid))
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Gate for collaborator routes that need a specific role
pub fn require_role(claims: &Claims, role: Role) -> Result<(), AppError> {
    if claims.has_role(role) {
        Ok(())
    } else {
        tracing::warn!(user_id = %claims.sub, required = %role, "Role check failed");
        Err(AppError::Auth(AuthError::Forbidden))
    }
}
