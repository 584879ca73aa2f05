/// JWT Token Issuance and Validation
///
/// Mints access/refresh token pairs and checks them. The two token kinds are
/// signed with separate secrets, so an access token never verifies as a
/// refresh token and vice versa.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::claims::Claims;
use crate::configuration::JwtSettings;
use crate::error::{AppError, AuthError};
use crate::users::Role;

/// Access and refresh token returned to clients
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TokenIssuer {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    access_token_expiry: i64,
    refresh_token_expiry: i64,
}

impl TokenIssuer {
    /// Build an issuer from configuration
    ///
    /// # Errors
    /// Returns a signing error if either secret is empty
    pub fn new(config: &JwtSettings) -> Result<Self, AppError> {
        if config.access_secret.is_empty() || config.refresh_secret.is_empty() {
            return Err(AuthError::Signing("signing secret unavailable".to_string()).into());
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.leeway = 0;

        Ok(Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            access_token_expiry: config.access_token_expiry,
            refresh_token_expiry: config.refresh_token_expiry,
        })
    }

    pub fn refresh_token_expiry(&self) -> i64 {
        self.refresh_token_expiry
    }

    /// Sign a new access/refresh pair
    ///
    /// The refresh token carries `jti` when supplied, otherwise a fresh
    /// random one.
    pub fn issue_token_pair(
        &self,
        user_id: Uuid,
        email: &str,
        roles: &[Role],
        jti: Option<String>,
    ) -> Result<TokenPair, AppError> {
        let access_claims = Claims::new(
            user_id,
            email,
            roles,
            None,
            self.access_token_expiry,
            &self.issuer,
        );
        let jti = jti.unwrap_or_else(|| Uuid::new_v4().to_string());
        let refresh_claims = Claims::new(
            user_id,
            email,
            roles,
            Some(jti),
            self.refresh_token_expiry,
            &self.issuer,
        );

        let header = Header::new(Algorithm::HS256);
        let access_token = encode(&header, &access_claims, &self.access_encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        let refresh_token = encode(&header, &refresh_claims, &self.refresh_encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Read claims without checking signature or expiry
    ///
    /// Only for tokens this process just minted, or for diagnostics.
    pub fn decode(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .ok()
    }

    /// Validate an access token's signature, issuer and expiry
    pub fn verify_access(&self, token: &str) -> Result<Claims, AppError> {
        self.verify(token, &self.access_decoding)
    }

    /// Validate a refresh token's signature, issuer and expiry
    pub fn verify_refresh(&self, token: &str) -> Result<Claims, AppError> {
        let claims = self.verify(token, &self.refresh_decoding)?;
        if claims.jti.is_none() {
            tracing::warn!(user_id = %claims.sub, "Refresh token without jti");
            return Err(AuthError::TokenInvalid.into());
        }
        Ok(claims)
    }

    fn verify(&self, token: &str, key: &DecodingKey) -> Result<Claims, AppError> {
        decode::<Claims>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::warn!("JWT validation error: {}", e);
                AuthError::TokenInvalid.into()
            })
    }
}
