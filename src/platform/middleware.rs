use std::sync::Arc;

use axum::{
    Extension,
    extract::Request,
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::{app_error::AppError, config::AuthConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Customer,
    Admin,
}

/// Token claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Role,
    pub exp: usize,
}

/// The authenticated caller, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct Customer {
    pub id: Uuid,
    pub email: Option<String>,
    pub role: Role,
}

pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|err| {
        tracing::debug!("Rejected bearer token: {}", err);
        AppError::Unauthorized
    })
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(AppError::Unauthorized)?;

    if token.is_empty() {
        return Err(AppError::Unauthorized);
    }
    Ok(token)
}

fn authenticate(headers: &HeaderMap, auth: &AuthConfig) -> Result<Customer, AppError> {
    let claims = decode_token(bearer_token(headers)?, &auth.jwt_secret)?;
    Ok(Customer {
        id: claims.sub,
        email: claims.email,
        role: claims.role,
    })
}

/// Requires a valid bearer token and exposes the caller as `Extension<Customer>`.
pub async fn customer_authorization(
    Extension(auth): Extension<Arc<AuthConfig>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let customer = authenticate(req.headers(), &auth)?;
    req.extensions_mut().insert(customer);
    Ok(next.run(req).await)
}

/// Same as [`customer_authorization`] but only lets admins through.
pub async fn admin_authorization(
    Extension(auth): Extension<Arc<AuthConfig>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let customer = authenticate(req.headers(), &auth)?;
    if customer.role != Role::Admin {
        return Err(AppError::ForbiddenResource(
            "Admin privileges are required".into(),
        ));
    }
    req.extensions_mut().insert(customer);
    Ok(next.run(req).await)
}

/// Scheduled jobs authenticate with the shared cron secret.
pub async fn cron_authorization(
    Extension(auth): Extension<Arc<AuthConfig>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())?;
    if !constant_time_eq(token.as_bytes(), auth.cron_secret.as_bytes()) {
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;

    fn token(secret: &str, role: Role, exp_offset: i64) -> String {
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: Some("shopper@example.com".into()),
            role,
            exp: (chrono::Utc::now().timestamp() + exp_offset) as usize,
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn decodes_a_valid_token() {
        let claims = decode_token(&token("secret", Role::Admin, 600), "secret").unwrap();
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.email.as_deref(), Some("shopper@example.com"));
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        assert!(decode_token(&token("secret", Role::Customer, 600), "other").is_err());
        assert!(decode_token(&token("secret", Role::Customer, -3600), "secret").is_err());
    }

    #[test]
    fn role_defaults_to_customer() {
        let raw = serde_json::json!({ "sub": Uuid::new_v4(), "exp": 1 });
        let claims: Claims = serde_json::from_value(raw).unwrap();
        assert_eq!(claims.role, Role::Customer);
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Token abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc");
    }

    #[test]
    fn constant_time_eq_compares_contents() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
