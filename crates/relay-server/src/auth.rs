use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use relay_core::collab::IdentityDecoder;
use relay_core::ids::UserId;
use relay_core::RelayError;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{AuthSettings, ConfigError};

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    sub: Option<String>,
}

/// Accepts HMAC-signed JWTs issued by the account service.
pub struct JwtIdentityDecoder {
    secret: SecretString,
    validation: Validation,
}

impl std::fmt::Debug for JwtIdentityDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityDecoder")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

impl JwtIdentityDecoder {
    pub fn new(secret: SecretString, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        Self { secret, validation }
    }

    pub fn hs256(secret: SecretString) -> Self {
        Self::new(secret, Algorithm::HS256)
    }

    pub fn from_settings(settings: &AuthSettings) -> Result<Self, ConfigError> {
        let algorithm: Algorithm = settings.algorithm.parse().map_err(|_| ConfigError::InvalidValue {
            key: "auth.algorithm".into(),
            value: settings.algorithm.clone(),
        })?;
        if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(ConfigError::Invalid(format!(
                "auth.algorithm {} needs a public key; only HMAC algorithms are supported",
                settings.algorithm
            )));
        }
        Ok(Self::new(settings.jwt_secret.clone(), algorithm))
    }
}

impl IdentityDecoder for JwtIdentityDecoder {
    fn decode_identity(&self, token: &str) -> Result<UserId, RelayError> {
        if token.trim().is_empty() {
            return Err(RelayError::Auth("missing token".into()));
        }
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let data = decode::<Claims>(token, &key, &self.validation)
            .map_err(|e| RelayError::Auth(format!("invalid token: {e}")))?;

        let user_id = match data.claims.user_id {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => data.claims.sub.filter(|s| !s.is_empty()),
        };
        user_id
            .map(UserId::from)
            .ok_or_else(|| RelayError::Auth("token carries no user id".into()))
    }
}

/// Bearer token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    use super::*;

    const SECRET: &str = "test-secret";

    fn token_for(claims: Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn decoder() -> JwtIdentityDecoder {
        JwtIdentityDecoder::hs256(SecretString::from(SECRET))
    }

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn decodes_string_user_id() {
        let token = token_for(json!({ "user_id": "17", "exp": far_future() }));
        assert_eq!(decoder().decode_identity(&token).unwrap().as_str(), "17");
    }

    #[test]
    fn decodes_numeric_user_id() {
        let token = token_for(json!({ "user_id": 17, "exp": far_future() }));
        assert_eq!(decoder().decode_identity(&token).unwrap().as_str(), "17");
    }

    #[test]
    fn falls_back_to_sub() {
        let token = token_for(json!({ "sub": "alice", "exp": far_future() }));
        assert_eq!(decoder().decode_identity(&token).unwrap().as_str(), "alice");
    }

    #[test]
    fn rejects_wrong_signature() {
        let token = encode(
            &Header::default(),
            &json!({ "user_id": "17", "exp": far_future() }),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        let err = decoder().decode_identity(&token).unwrap_err();
        assert_eq!(err.error_kind(), "auth");
    }

    #[test]
    fn rejects_expired_token() {
        let token = token_for(json!({ "user_id": "17", "exp": 1_000_000 }));
        assert_eq!(decoder().decode_identity(&token).unwrap_err().error_kind(), "auth");
    }

    #[test]
    fn rejects_token_without_identity() {
        let token = token_for(json!({ "exp": far_future() }));
        assert!(decoder().decode_identity(&token).is_err());
    }

    #[test]
    fn rejects_garbage_and_blank() {
        assert!(decoder().decode_identity("not-a-jwt").is_err());
        assert!(decoder().decode_identity("  ").is_err());
    }

    #[test]
    fn from_settings_picks_algorithm() {
        let settings = AuthSettings {
            jwt_secret: SecretString::from(SECRET),
            algorithm: "HS512".into(),
        };
        let decoder = JwtIdentityDecoder::from_settings(&settings).unwrap();
        assert_eq!(decoder.validation.algorithms, vec![Algorithm::HS512]);

        let rsa = AuthSettings {
            algorithm: "RS256".into(),
            ..settings.clone()
        };
        assert!(JwtIdentityDecoder::from_settings(&rsa).is_err());

        let bogus = AuthSettings {
            algorithm: "nope".into(),
            ..settings
        };
        assert!(matches!(
            JwtIdentityDecoder::from_settings(&bogus),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert("authorization", "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
