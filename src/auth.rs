//! Hash de contraseñas, emisión/verificación de JWT y extractor del usuario actual.

use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{app_state::AppState, db, error::AppError, models::{TokenPair, User}};

/// Genera un hash Argon2id (formato PHC) con sal aleatoria.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("No se pudo generar el hash de la contraseña: {e}"))
}

/// Devuelve `false` también si el hash almacenado está corrupto.
pub fn verify_password(password: &str, hashed: &str) -> bool {
    match PasswordHash::new(hashed) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims de los tokens emitidos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub typ: TokenKind,
}

#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn create_access_token(&self, subject: &str) -> Result<String> {
        self.sign(subject, TokenKind::Access, self.access_ttl)
    }

    pub fn create_refresh_token(&self, subject: &str) -> Result<String> {
        self.sign(subject, TokenKind::Refresh, self.refresh_ttl)
    }

    pub fn issue_pair(&self, subject: &str) -> Result<TokenPair> {
        Ok(TokenPair::bearer(
            self.create_access_token(subject)?,
            self.create_refresh_token(subject)?,
        ))
    }

    /// Verifica firma, expiración y tipo del token.
    pub fn decode(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        if data.claims.typ != expected {
            return Err(anyhow!(
                "Tipo de token inesperado: {:?} (se esperaba {:?})",
                data.claims.typ,
                expected
            ));
        }
        Ok(data.claims)
    }

    fn sign(&self, subject: &str, typ: TokenKind, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            typ,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }
}

/// Usuario autenticado mediante `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let (scheme, token) = value.split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .filter(|token| !token.is_empty())
            .ok_or(AppError::NotAuthenticated)?;

        let claims = state.tokens.decode(token, TokenKind::Access).map_err(|e| {
            debug!("Token de acceso rechazado: {}", e);
            AppError::InvalidToken
        })?;

        db::find_user_by_username(&state.db, &claims.sub)
            .await?
            .map(CurrentUser)
            .ok_or(AppError::UserNotFound)
    }
}
