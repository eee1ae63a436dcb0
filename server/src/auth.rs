//! Authenticator (C8): verifies bearer JWTs and produces an [`Identity`].
//!
//! Replaces the earlier `did:plc`/`did:web` HTTP-resolution flow — this
//! system's tokens are conventional signed JWTs, verified against a
//! configured public key, shared secret, or JWKS endpoint — but keeps the
//! moka-cached verification shape and the JTI-replay cache the same way the
//! prior version cached DID documents.

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use moka::sync::Cache;
use serde::Deserialize;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::models::Identity;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed authorization header")]
    InvalidAuthFormat,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("no verification key available for this token")]
    NoKey,
    #[error("token replayed")]
    ReplayedToken,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(default)]
    scope: Vec<String>,
    iat: Option<i64>,
    exp: i64,
    jti: Option<String>,
}

/// Verifies bearer tokens against either a static key (secret or PEM,
/// selected by algorithm) or a JWKS endpoint keyed by `kid`. Only one of
/// the two key sources needs to be configured; a deployment with a JWKS URL
/// never needs `jwtPublicKeyPem`/`jwtSecret` at all.
pub struct Authenticator {
    config: AuthConfig,
    static_keys: Vec<(Algorithm, DecodingKey)>,
    jwks_cache: Cache<String, DecodingKey>,
    jti_cache: Cache<String, ()>,
    http_client: Option<reqwest::Client>,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let mut static_keys = Vec::new();
        for alg_name in &config.jwt_algorithms {
            if let Some((alg, key)) = build_static_key(alg_name, &config)? {
                static_keys.push((alg, key));
            }
        }

        let http_client = config
            .jwks_url
            .is_some()
            .then(|| reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build())
            .transpose()
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(Self {
            jti_cache: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(config.jti_ttl)
                .build(),
            jwks_cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(std::time::Duration::from_secs(3600))
                .build(),
            static_keys,
            http_client,
            config,
        })
    }

    pub async fn authenticate(&self, headers: &axum::http::HeaderMap) -> Result<Identity, AuthError> {
        let token = extract_bearer(headers)?;
        self.verify_token(&token).await
    }

    pub async fn verify_token(&self, token: &str) -> Result<Identity, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let key = self.resolve_key(&header).await?;

        let mut validation = Validation::new(header.alg);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }
        if let Some(audience) = &self.config.audience {
            validation.set_audience(&[audience.as_str()]);
        }
        validation.leeway = self.config.clock_skew.as_secs();
        validation.validate_nbf = true;

        let data = decode::<TokenClaims>(token, &key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        self.finish(data.claims)
    }

    fn finish(&self, claims: TokenClaims) -> Result<Identity, AuthError> {
        let jti = claims
            .jti
            .ok_or_else(|| AuthError::InvalidToken("missing jti claim".into()))?;
        if self.jti_cache.contains_key(&jti) {
            return Err(AuthError::ReplayedToken);
        }
        self.jti_cache.insert(jti, ());

        Ok(Identity {
            account_id: claims.sub,
            device_id: claims.device_id,
            session_id: claims.session_id,
            scope: claims.scope,
            issued_at: claims
                .iat
                .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                .unwrap_or_else(chrono::Utc::now),
            expires_at: chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(chrono::Utc::now),
        })
    }

    async fn resolve_key(&self, header: &Header) -> Result<DecodingKey, AuthError> {
        if let Some(jwks_url) = self.config.jwks_url.clone() {
            let kid = header.kid.clone().ok_or(AuthError::NoKey)?;
            if let Some(key) = self.jwks_cache.get(&kid) {
                return Ok(key);
            }
            let key = self.fetch_jwks_key(&jwks_url, &kid).await?;
            self.jwks_cache.insert(kid, key.clone());
            return Ok(key);
        }

        self.static_keys
            .iter()
            .find(|(alg, _)| *alg == header.alg)
            .map(|(_, key)| key.clone())
            .ok_or(AuthError::NoKey)
    }

    async fn fetch_jwks_key(&self, url: &str, kid: &str) -> Result<DecodingKey, AuthError> {
        #[derive(Deserialize)]
        struct Jwks {
            keys: Vec<serde_json::Value>,
        }

        let client = self.http_client.as_ref().ok_or(AuthError::NoKey)?;
        let jwks: Jwks = client
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let jwk = jwks
            .keys
            .into_iter()
            .find(|k| k.get("kid").and_then(|v| v.as_str()) == Some(kid))
            .ok_or(AuthError::NoKey)?;

        let n = jwk.get("n").and_then(|v| v.as_str()).ok_or(AuthError::NoKey)?;
        let e = jwk.get("e").and_then(|v| v.as_str()).ok_or(AuthError::NoKey)?;
        DecodingKey::from_rsa_components(n, e).map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

fn build_static_key(alg_name: &str, config: &AuthConfig) -> Result<Option<(Algorithm, DecodingKey)>, AuthError> {
    match alg_name {
        "HS256" => match &config.jwt_secret {
            Some(secret) => Ok(Some((Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes())))),
            None => Ok(None),
        },
        "ES256" => match &config.jwt_public_key_pem {
            Some(pem) => DecodingKey::from_ec_pem(pem.as_bytes())
                .map(|k| Some((Algorithm::ES256, k)))
                .map_err(|e| AuthError::InvalidToken(e.to_string())),
            None => Ok(None),
        },
        "RS256" => match &config.jwt_public_key_pem {
            Some(pem) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map(|k| Some((Algorithm::RS256, k)))
                .map_err(|e| AuthError::InvalidToken(e.to_string())),
            None => Ok(None),
        },
        other => {
            tracing::warn!(algorithm = other, "unrecognized auth algorithm in config, ignoring");
            Ok(None)
        }
    }
}

fn extract_bearer(headers: &axum::http::HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?;
    let raw = value.to_str().map_err(|_| AuthError::InvalidAuthFormat)?;
    raw.strip_prefix("Bearer ")
        .map(|t| t.to_string())
        .ok_or(AuthError::InvalidAuthFormat)
}
