use anyhow::{bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    username: String,
    iat: i64,
    exp: i64,
}

/// The identity carried by a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: Uuid,
    pub username: String,
}

/// Verifies (and, for tooling and tests, issues) HS256 access tokens.
///
/// The gateway only consumes `verify`; issuance belongs to the external
/// auth service, which shares the secret.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<TokenIdentity> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("access token subject '{}' is not a UUID", claims.sub))?;

        Ok(TokenIdentity { user_id, username: claims.username })
    }

    pub fn issue_token(&self, user_id: Uuid, username: &str) -> anyhow::Result<String> {
        self.issue_token_at(user_id, username, current_unix_timestamp()?)
    }

    fn issue_token_at(
        &self,
        user_id: Uuid,
        username: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            username: username.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before unix epoch")?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtVerifier, ACCESS_TOKEN_TTL_SECONDS};
    use uuid::Uuid;

    const TEST_SECRET: &str = "parlor_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_verifies_tokens() {
        let verifier = JwtVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let user_id = Uuid::new_v4();

        let token = verifier.issue_token(user_id, "joe").expect("token should be issued");
        let identity = verifier.verify(&token).expect("token should verify");

        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.username, "joe");
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtVerifier::new("too_short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = JwtVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token(Uuid::new_v4(), "joe").expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = JwtVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token = verifier
            .issue_token_at(Uuid::new_v4(), "joe", issued_at)
            .expect("token should be issued");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_tokens_with_non_uuid_subject() {
        // A token with sub="service-account" from some other issuer.
        let verifier = JwtVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let other = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &serde_json::json!({
                "sub": "service-account",
                "username": "svc",
                "iat": current_unix_timestamp().unwrap(),
                "exp": current_unix_timestamp().unwrap() + 60,
            }),
            &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(verifier.verify(&other).is_err());
    }
}
