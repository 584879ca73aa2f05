/// Credential Hashing and Verification
///
/// Argon2id hashing for account passwords and for stored refresh tokens.
/// The raw refresh token is hashed before storage so a database dump cannot
/// be replayed as a bearer credential.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;

use crate::configuration::HashingSettings;
use crate::error::{AppError, ConfigError, ValidationError};

const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 128;
const DUMMY_SECRET: &str = "restroom-auth-absent-account";

/// Salted, memory-hard one-way hasher
#[derive(Clone)]
pub struct CredentialHasher {
    argon2: Argon2<'static>,
    // Same cost parameters as real hashes
    dummy_hash: String,
}

impl CredentialHasher {
    /// Build a hasher from configured Argon2id cost parameters
    ///
    /// # Errors
    /// Returns a config error if the parameters are out of range
    pub fn new(settings: &HashingSettings) -> Result<Self, AppError> {
        let params = Params::new(
            settings.memory_kib,
            settings.iterations,
            settings.parallelism,
            None,
        )
        .map_err(|e| ConfigError::InvalidValue(format!("hashing: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::generate(&mut OsRng);
        let dummy_hash = argon2
            .hash_password(DUMMY_SECRET.as_bytes(), &salt)?
            .to_string();

        Ok(Self { argon2, dummy_hash })
    }

    /// Hash a secret with a fresh random salt, returning a PHC string
    pub fn hash(&self, secret: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self.argon2.hash_password(secret.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    /// Check a candidate against a stored PHC string
    ///
    /// Mismatch is `Ok(false)`. Only a malformed stored hash is an error.
    pub fn verify(&self, hashed: &str, candidate: &str) -> Result<bool, AppError> {
        let parsed = PasswordHash::new(hashed)?;
        match self.argon2.verify_password(candidate.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Spend one full verification when there is no stored hash to check
    /// against, so an unknown account costs as much as a wrong password.
    pub fn verify_absent(&self, candidate: &str) {
        let _ = self.verify(&self.dummy_hash, candidate);
    }
}

/// Validate sign-up password length
///
/// Requirements:
/// - Minimum 8 characters
/// - Maximum 128 characters
pub fn validate_password_strength(password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::EmptyField("password"));
    }

    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::TooShort("password", MIN_PASSWORD_LENGTH));
    }

    // Upper bound keeps hashing cost bounded per request
    if length > MAX_PASSWORD_LENGTH {
        return Err(ValidationError::TooLong("password", MAX_PASSWORD_LENGTH));
    }

    Ok(())
}
