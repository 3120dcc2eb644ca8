pub mod certificate;
pub mod health;
pub mod invoices;
pub mod sales;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::server::errors::AppError;

/// Header set by the authentication gateway in front of the service.
pub const USER_HEADER: &str = "x-user-id";

/// The user the request acts on behalf of.
#[derive(Debug, Clone)]
pub struct ActingUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ActingUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| ActingUser(user.to_string()))
            .ok_or(AppError::MissingUser)
    }
}
