use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

// ============================================================================
// Roles and principals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Player,
    Spectator,
    Admin,
}

/// The authenticated subject behind a connection. Built once at upgrade from
/// the verified token; immutable for the life of the connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub username: String,
    /// Role names as issued by the auth service. The strongest recognized
    /// role wins; unknown names are ignored.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    fn new(user_id: Uuid, username: String, roles: Vec<String>, expiration_minutes: i64) -> Self {
        let now = Utc::now();
        let exp = now + Duration::minutes(expiration_minutes);

        Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            username,
            roles,
        }
    }

    pub fn user_id(&self) -> GatewayResult<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| GatewayError::InvalidToken)
    }

    /// Role carried by the token, if any. Admin outranks player outranks
    /// spectator when several are present.
    pub fn role(&self) -> Option<Role> {
        let mut found: Option<Role> = None;
        for name in &self.roles {
            match name.parse::<Role>() {
                Ok(Role::Admin) => return Some(Role::Admin),
                Ok(Role::Player) => found = Some(Role::Player),
                Ok(Role::Spectator) => {
                    if found.is_none() {
                        found = Some(Role::Spectator);
                    }
                }
                Err(_) => {}
            }
        }
        found
    }
}

// ============================================================================
// JWT Operations
// ============================================================================

pub fn create_token(
    user_id: Uuid,
    username: &str,
    roles: &[&str],
    secret: &str,
) -> GatewayResult<String> {
    let claims = Claims::new(
        user_id,
        username.to_owned(),
        roles.iter().map(|r| (*r).to_owned()).collect(),
        15,
    );

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(error = ?e, "Failed to create token");
        GatewayError::InvalidToken
    })
}

pub fn validate_token(token: &str, secret: &str) -> GatewayResult<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        tracing::warn!(error = ?e, "Token validation failed");
        GatewayError::InvalidToken
    })
}

// ============================================================================
// Verifier capability
// ============================================================================

/// The one capability the upgrade path needs from the auth service.
///
/// `fallback_role` is the role derived from the upgrade query (`role` /
/// `spectator` parameters); it applies only when the token carries no role of
/// its own — a role in the token always overrides the query.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str, fallback_role: Role) -> GatewayResult<Principal>;
}

/// Production verifier: local HMAC validation of the bearer token.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str, fallback_role: Role) -> GatewayResult<Principal> {
        let claims = validate_token(token, &self.secret)?;
        let user_id = claims.user_id()?;
        let role = claims.role().unwrap_or(fallback_role);

        Ok(Principal {
            user_id,
            username: claims.username,
            role,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
