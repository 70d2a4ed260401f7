use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token invalid: {0}")]
    TokenInvalid(String),
    #[error("Token expired")]
    TokenExpired,
}

const PASSWORD_SCHEME: &str = "pbkdf2-sha256";
const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Produces `pbkdf2-sha256$<iterations>$<salt_b64>$<hash_b64>` with a
/// fresh random salt. The iteration count is embedded so stored hashes
/// survive a future bump.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = derive_key(password, &salt, PBKDF2_ITERATIONS);
    format!(
        "{}${}${}${}",
        PASSWORD_SCHEME,
        PBKDF2_ITERATIONS,
        BASE64.encode(salt),
        BASE64.encode(digest)
    )
}

/// Constant-time comparison against a stored hash string. Any parse
/// failure of the stored value counts as a mismatch, never a panic.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt_b64), Some(hash_b64), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PASSWORD_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (BASE64.decode(salt_b64), BASE64.decode(hash_b64)) else {
        return false;
    };

    let computed = derive_key(password, &salt, iterations);
    computed.ct_eq(expected.as_slice()).into()
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

/// HS256 bearer tokens. Compact JWT encoding, URL-safe base64 without
/// padding; verification recomputes the MAC over the received header
/// and payload segments and enforces expiry.
pub struct AccessTokens {
    secret: String,
    ttl: Duration,
}

impl AccessTokens {
    pub fn new(secret: impl Into<String>, ttl_hours: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn issue(&self, username: &str) -> Result<String, AuthError> {
        let now = Utc::now();
        let header = TokenHeader {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let claims = TokenClaims {
            sub: username.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header).map_err(|e| AuthError::TokenInvalid(e.to_string()))?,
        );
        let claims_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).map_err(|e| AuthError::TokenInvalid(e.to_string()))?,
        );
        let message = format!("{}.{}", header_b64, claims_b64);

        let mut mac = self.mac()?;
        mac.update(message.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", message, signature))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::TokenInvalid("expected three segments".to_string()));
        };

        let mut mac = self.mac()?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::TokenInvalid("bad signature encoding".to_string()))?;
        mac.verify_slice(&sig_bytes)
            .map_err(|_| AuthError::TokenInvalid("signature mismatch".to_string()))?;

        let claim_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::TokenInvalid("bad payload encoding".to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&claim_bytes)
            .map_err(|e| AuthError::TokenInvalid(e.to_string()))?;

        if claims.exp < Utc::now().timestamp() {
            return Err(AuthError::TokenExpired);
        }
        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AuthError::TokenInvalid(e.to_string()))
    }
}

/// Verifies the billing provider's signature header:
/// base64(HMAC-SHA256(secret, raw_body)). Must run over the exact
/// bytes received, never a re-serialized body.
pub fn verify_webhook_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let Ok(provided) = BASE64.decode(signature.trim()) else {
        return false;
    };
    mac.verify_slice(&provided).is_ok()
}

/// Counterpart of `verify_webhook_signature`; what a well-behaved
/// provider computes for a payload.
pub fn sign_webhook_payload(secret: &str, payload: &[u8]) -> Result<String, AuthError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::TokenInvalid(e.to_string()))?;
    mac.update(payload);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let stored = hash_password("hunter2-but-longer");
        assert!(stored.starts_with("pbkdf2-sha256$"));
        assert!(verify_password("hunter2-but-longer", &stored));
        assert!(!verify_password("wrong-password", &stored));
    }

    #[test]
    fn two_hashes_of_the_same_password_differ() {
        let first = hash_password("same-password");
        let second = hash_password("same-password");
        assert_ne!(first, second, "salts must be random");
        assert!(verify_password("same-password", &first));
        assert!(verify_password("same-password", &second));
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        for stored in [
            "",
            "plaintext",
            "pbkdf2-sha256$notanumber$c2FsdA$aGFzaA",
            "pbkdf2-sha256$1000$!!!$aGFzaA",
            "md5$1$c2FsdA$aGFzaA",
            "pbkdf2-sha256$1000$c2FsdA$aGFzaA$extra",
        ] {
            assert!(!verify_password("anything", stored), "accepted: {}", stored);
        }
    }

    #[test]
    fn token_round_trip() {
        let tokens = AccessTokens::new("test-signing-secret", 24);
        let token = tokens.issue("ada").expect("Failed to issue token");

        let claims = tokens.verify(&token).expect("Failed to verify token");
        assert_eq!(claims.sub, "ada");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn tampered_token_is_rejected() {
        let tokens = AccessTokens::new("test-signing-secret", 24);
        let token = tokens.issue("ada").expect("Failed to issue token");

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&TokenClaims {
                sub: "grace".to_string(),
                iat: 0,
                exp: i64::MAX,
            })
            .expect("Failed to serialize claims"),
        );
        parts[1] = &forged_claims;
        let forged = parts.join(".");

        assert!(tokens.verify(&forged).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = AccessTokens::new("secret-a", 24);
        let verifier = AccessTokens::new("secret-b", 24);
        let token = issuer.issue("ada").expect("Failed to issue token");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = AccessTokens::new("test-signing-secret", -1);
        let token = tokens.issue("ada").expect("Failed to issue token");
        assert!(matches!(tokens.verify(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let tokens = AccessTokens::new("test-signing-secret", 24);
        for garbage in ["", "abc", "a.b", "a.b.c.d", "not base64 . at all . nope"] {
            assert!(tokens.verify(garbage).is_err(), "accepted: {}", garbage);
        }
    }

    #[test]
    fn webhook_signature_round_trip() {
        let payload = br#"{"eventType":"subscription.created"}"#;
        let signature = sign_webhook_payload("whsec_test", payload).expect("Failed to sign");

        assert!(verify_webhook_signature("whsec_test", payload, &signature));
        assert!(!verify_webhook_signature("whsec_other", payload, &signature));
        assert!(!verify_webhook_signature("whsec_test", b"different body", &signature));
        assert!(!verify_webhook_signature("whsec_test", payload, "not-base64!!!"));
    }

    #[test]
    fn signature_depends_on_exact_bytes() {
        // Same JSON value, different byte layout.
        let compact = br#"{"a":1,"b":2}"#;
        let spaced = br#"{ "a": 1, "b": 2 }"#;
        let signature = sign_webhook_payload("whsec_test", compact).expect("Failed to sign");

        assert!(verify_webhook_signature("whsec_test", compact, &signature));
        assert!(!verify_webhook_signature("whsec_test", spaced, &signature));
    }
}
