//! Credential hashing and bearer-token issuance/verification.
//!
//! Passwords are hashed with Argon2id. Tokens are HS256 JWTs carrying the
//! user id and a role snapshot taken at issuance; there is no revocation
//! list, tokens die by expiry or account deactivation.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::errors::ApiError;
use crate::models::{Role, User};

/// Minimum accepted password length at registration.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Claims embedded in every token the server issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    /// Role snapshot at issuance time. A promoted/demoted user must log in
    /// again for this to update.
    pub role: Role,
    /// Expiry (Unix timestamp, seconds).
    pub exp: i64,
    /// Issued-at (Unix timestamp, seconds).
    pub iat: i64,
}

/// Signing/verification keys plus token lifetime, built once at startup and
/// carried in the shared application state.
pub struct AuthContext {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_hours: i64,
}

impl AuthContext {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn issue_token(&self, user: &User) -> Result<String, ApiError> {
        self.issue_token_with_lifetime(user, self.expiry_hours)
    }

    fn issue_token_with_lifetime(&self, user: &User, hours: i64) -> Result<String, ApiError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            role: user.role,
            exp: now + hours * 3600,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Internal(format!("Failed to sign token: {}", e)))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    ApiError::Authentication("Token expired".to_string())
                }
                _ => ApiError::Authentication("Could not validate credentials".to_string()),
            })
    }
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, role: Role) -> User {
        User {
            id,
            email: "u@example.com".to_string(),
            full_name: "U".to_string(),
            role,
            is_active: true,
            created_at: "2024-01-01 00:00:00".to_string(),
            updated_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn password_hash_verifies_and_rejects() {
        let hash = hash_password("hunter2!").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("hunter2!", &hash));
        assert!(!verify_password("hunter3!", &hash));
    }

    #[test]
    fn verify_password_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn token_roundtrip_carries_id_and_role() {
        let ctx = AuthContext::new("test-secret", 24);
        let token = ctx.issue_token(&user(42, Role::Maintainer)).unwrap();
        let claims = ctx.verify_token(&token).unwrap();
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.role, Role::Maintainer);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected() {
        let ctx = AuthContext::new("test-secret", 24);
        let token = ctx
            .issue_token_with_lifetime(&user(1, Role::Reporter), -2)
            .unwrap();
        let err = ctx.verify_token(&token).unwrap_err();
        match err {
            ApiError::Authentication(msg) => assert!(msg.contains("expired")),
            other => panic!("Expected Authentication error, got {:?}", other),
        }
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let ctx = AuthContext::new("secret-a", 24);
        let other = AuthContext::new("secret-b", 24);
        let token = other.issue_token(&user(1, Role::Admin)).unwrap();
        assert!(matches!(
            ctx.verify_token(&token),
            Err(ApiError::Authentication(_))
        ));
    }

    #[test]
    fn malformed_token_is_rejected() {
        let ctx = AuthContext::new("test-secret", 24);
        assert!(matches!(
            ctx.verify_token("not.a.jwt"),
            Err(ApiError::Authentication(_))
        ));
    }
}
