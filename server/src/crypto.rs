//! Credential handling for Aether Server
//!
//! - Password hashing (PBKDF2-HMAC-SHA256)
//! - JWT issue / verification (HS256)
//! - Token fingerprints for the revocation list

use std::num::NonZeroU32;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::{
    digest, pbkdf2,
    rand::{SecureRandom, SystemRandom},
};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LENGTH: usize = 16;
const HASH_SCHEME: &str = "pbkdf2-sha256";

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

// ============================================================================
// Passwords
// ============================================================================

/// Hash a password as `pbkdf2-sha256$<iterations>$<salt>$<hash>`
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LENGTH];
    rng.fill(&mut salt)
        .map_err(|_| anyhow::anyhow!("failed to generate salt"))?;

    let mut hash = [0u8; digest::SHA256_OUTPUT_LEN];
    pbkdf2::derive(
        PBKDF2_ALG,
        iterations(PBKDF2_ITERATIONS),
        &salt,
        password.as_bytes(),
        &mut hash,
    );

    Ok(format!(
        "{}${}${}${}",
        HASH_SCHEME,
        PBKDF2_ITERATIONS,
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(hash)
    ))
}

/// Verify a password against a stored hash; malformed hashes never match
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(HASH_SCHEME), Some(iters), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    let Ok(iters) = iters.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (URL_SAFE_NO_PAD.decode(salt), URL_SAFE_NO_PAD.decode(hash)) else {
        return false;
    };

    pbkdf2::verify(
        PBKDF2_ALG,
        iterations(iters),
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

fn iterations(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

/// SHA-256 fingerprint of a token, used as the revocation-list key
pub fn hash_token(token: &str) -> String {
    let hash = digest::digest(&digest::SHA256, token.as_bytes());
    hex::encode(hash.as_ref())
}

// ============================================================================
// JWT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub email: String,
    pub username: String,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token so two tokens issued in the same second differ
    pub jti: String,
}

/// Identity a token is issued for
pub struct TokenSubject<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub username: &'a str,
}

pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl JwtKeys {
    pub fn new(secret: &str, access_ttl_secs: i64, refresh_ttl_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
        }
    }

    pub fn from_config(auth: &AuthConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            &auth.jwt_secret,
            auth.access_ttl_secs()?,
            auth.refresh_ttl_secs()?,
        ))
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    pub fn issue(
        &self,
        subject: &TokenSubject<'_>,
        token_type: TokenType,
    ) -> anyhow::Result<IssuedToken> {
        let ttl = match token_type {
            TokenType::Access => self.access_ttl_secs,
            TokenType::Refresh => self.refresh_ttl_secs,
        };
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.id.to_string(),
            email: subject.email.to_string(),
            username: subject.username.to_string(),
            token_type,
            iat: now,
            exp: now + ttl,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
        })
    }

    /// Verifies signature, expiry and token type
    pub fn verify(&self, token: &str, expected: TokenType) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .ok()?
            .claims;
        (claims.token_type == expected).then_some(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> TokenSubject<'static> {
        TokenSubject {
            id: "u1",
            email: "a@example.com",
            username: "alice",
        }
    }

    #[test]
    fn test_password_verification() {
        let hash = hash_password("hunter22").unwrap();
        assert!(hash.starts_with("pbkdf2-sha256$100000$"));

        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
        assert!(!verify_password("hunter22", "garbage"));
        assert_ne!(hash, hash_password("hunter22").unwrap());
    }

    #[test]
    fn test_token_round_trip() {
        let keys = JwtKeys::new("secret", 3600, 7200);
        let issued = keys.issue(&subject(), TokenType::Access).unwrap();

        let claims = keys.verify(&issued.token, TokenType::Access).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.exp, issued.expires_at);
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_token_type_is_enforced() {
        let keys = JwtKeys::new("secret", 3600, 7200);
        let refresh = keys.issue(&subject(), TokenType::Refresh).unwrap();
        assert!(keys.verify(&refresh.token, TokenType::Access).is_none());
        assert!(keys.verify(&refresh.token, TokenType::Refresh).is_some());
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let issued = JwtKeys::new("secret", 3600, 7200)
            .issue(&subject(), TokenType::Access)
            .unwrap();
        let other = JwtKeys::new("other", 3600, 7200);
        assert!(other.verify(&issued.token, TokenType::Access).is_none());
        assert!(other.verify("not.a.jwt", TokenType::Access).is_none());
    }

    #[test]
    fn test_tokens_are_unique() {
        let keys = JwtKeys::new("secret", 3600, 7200);
        let a = keys.issue(&subject(), TokenType::Access).unwrap();
        let b = keys.issue(&subject(), TokenType::Access).unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(hash_token(&a.token), hash_token(&b.token));
        assert_eq!(hash_token("abc").len(), 64);
    }
}
