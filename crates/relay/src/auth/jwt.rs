use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 30 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Claims the relay relies on after a token has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Email handle of the account the token was issued to.
    pub subject: String,
    pub expires_at: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("access token has expired")]
    Expired,
    #[error("access token is invalid: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct JwtTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_seconds: i64,
}

impl JwtTokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        Self::with_ttl(secret, DEFAULT_TOKEN_TTL_SECONDS)
    }

    pub fn with_ttl(secret: &str, ttl_seconds: i64) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }
        if ttl_seconds <= 0 {
            bail!("token ttl must be positive, got {ttl_seconds}s");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_seconds,
        })
    }

    pub fn issue_token(&self, subject: &str) -> anyhow::Result<String> {
        self.issue_token_at(subject, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, subject: &str, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: subject.to_owned(),
            iat: issued_at,
            exp: issued_at
                .checked_add(self.ttl_seconds)
                .ok_or_else(|| anyhow!("token expiry overflows for ttl {}s", self.ttl_seconds))?,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Verify signature and expiry. Never panics on hostile input.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Invalid(error.to_string()),
            })?
            .claims;

        let subject = claims.sub.trim();
        if subject.is_empty() {
            return Err(VerifyError::Invalid("subject claim is empty".to_owned()));
        }

        Ok(TokenClaims { subject: subject.to_owned(), expires_at: claims.exp })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
pub(crate) fn issue_expired_token_for_tests(
    verifier: &JwtTokenVerifier,
    subject: &str,
) -> String {
    let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
        - verifier.ttl_seconds
        - 1;
    verifier.issue_token_at(subject, issued_at).expect("expired token should encode")
}

#[cfg(test)]
mod tests {
    use super::{
        current_unix_timestamp, issue_expired_token_for_tests, JwtTokenVerifier, VerifyError,
        DEFAULT_TOKEN_TTL_SECONDS,
    };
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "collab_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_verifies_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");

        let token = verifier.issue_token("alice@example.com").expect("token should be issued");
        let claims = verifier.verify(&token).expect("token should verify");

        assert_eq!(claims.subject, "alice@example.com");
        assert!(claims.expires_at > current_unix_timestamp().expect("clock"));
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtTokenVerifier::new("too-short").is_err());
    }

    #[test]
    fn rejects_non_positive_ttl() {
        assert!(JwtTokenVerifier::with_ttl(TEST_SECRET, 0).is_err());
    }

    #[test]
    fn issuing_fails_instead_of_overflowing_expiry() {
        let verifier =
            JwtTokenVerifier::with_ttl(TEST_SECRET, i64::MAX).expect("verifier should initialize");

        assert!(verifier.issue_token("alice@example.com").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token("alice@example.com").expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(matches!(verifier.verify(&tampered), Err(VerifyError::Invalid(_))));
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let issuer = JwtTokenVerifier::new("another_secret_that_is_also_long_enough_!!")
            .expect("issuer should initialize");
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = issuer.issue_token("alice@example.com").expect("token should be issued");

        assert!(matches!(verifier.verify(&token), Err(VerifyError::Invalid(_))));
    }

    #[test]
    fn rejects_malformed_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");

        assert!(matches!(verifier.verify(""), Err(VerifyError::Invalid(_))));
        assert!(matches!(verifier.verify("not.a.jwt"), Err(VerifyError::Invalid(_))));
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = issue_expired_token_for_tests(&verifier, "alice@example.com");

        assert_eq!(verifier.verify(&token), Err(VerifyError::Expired));
    }

    #[test]
    fn rejects_tokens_with_blank_subject() {
        #[derive(Serialize)]
        struct BlankSubjectClaims {
            sub: &'static str,
            iat: i64,
            exp: i64,
        }

        let verifier = JwtTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims =
            BlankSubjectClaims { sub: "  ", iat: now, exp: now + DEFAULT_TOKEN_TTL_SECONDS };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(matches!(verifier.verify(&token), Err(VerifyError::Invalid(_))));
    }
}
