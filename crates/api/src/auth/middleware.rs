//! Identity middleware

use axum::{
    extract::Request,
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use eventpass_billing::Actor;
use uuid::Uuid;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Caller identity forwarded by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn actor(&self) -> Actor {
        match self.role {
            Role::User => Actor::User(self.user_id),
            Role::Admin => Actor::Admin(self.user_id),
        }
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions)
        }
    }

    fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .ok_or(AuthError::MissingIdentity)?
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or(AuthError::InvalidIdentity)?;

        // Role defaults to a plain user
        let role = match headers.get(USER_ROLE_HEADER) {
            None => Role::User,
            Some(value) => value
                .to_str()
                .ok()
                .and_then(Role::parse)
                .ok_or(AuthError::InvalidIdentity)?,
        };

        Ok(Self { user_id, role })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing caller identity")]
    MissingIdentity,
    #[error("Invalid caller identity")]
    InvalidIdentity,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

/// Reject requests without a caller identity, otherwise attach [`AuthUser`]
pub async fn require_identity(mut request: Request, next: Next) -> Response {
    match AuthUser::from_headers(request.headers()) {
        Ok(auth_user) => {
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "Rejected request without identity");
            ApiError::from(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_user_role_is_default() {
        let id = Uuid::new_v4();
        let user = AuthUser::from_headers(&headers(&[(USER_ID_HEADER, &id.to_string())])).unwrap();
        assert_eq!(user.role, Role::User);
        assert_eq!(user.actor(), Actor::User(id));
        assert!(user.require_admin().is_err());
    }

    #[test]
    fn test_admin_role_maps_to_admin_actor() {
        let id = Uuid::new_v4();
        let user = AuthUser::from_headers(&headers(&[
            (USER_ID_HEADER, &id.to_string()),
            (USER_ROLE_HEADER, "Admin"),
        ]))
        .unwrap();
        assert_eq!(user.actor(), Actor::Admin(id));
        assert!(user.require_admin().is_ok());
    }

    #[test]
    fn test_missing_or_garbled_identity_rejected() {
        assert!(matches!(
            AuthUser::from_headers(&HeaderMap::new()),
            Err(AuthError::MissingIdentity)
        ));
        assert!(matches!(
            AuthUser::from_headers(&headers(&[(USER_ID_HEADER, "not-a-uuid")])),
            Err(AuthError::InvalidIdentity)
        ));
        assert!(matches!(
            AuthUser::from_headers(&headers(&[
                (USER_ID_HEADER, &Uuid::new_v4().to_string()),
                (USER_ROLE_HEADER, "superuser"),
            ])),
            Err(AuthError::InvalidIdentity)
        ));
    }
}
