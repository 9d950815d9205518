//! Password hashing using Argon2id
//!
//! Hashes are stored as PHC strings, so verification reads its parameters
//! from the stored hash and keeps working after the configuration changes.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2Hasher, PasswordVerifier,
        SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::config::PasswordConfig;
use crate::error::{Error, Result};

/// Argon2id hasher with a minimum-length policy
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
    min_length: usize,
}

impl PasswordHasher {
    /// Fails with [`Error::Configuration`] when the Argon2 parameters are out of range
    pub fn new(config: &PasswordConfig) -> Result<Self> {
        let params = Params::new(
            config.memory_cost_kib,
            config.time_cost,
            config.parallelism,
            None,
        )
        .map_err(|e| Error::Configuration(format!("invalid Argon2 parameters: {}", e)))?;

        Ok(Self {
            params,
            min_length: config.min_length,
        })
    }

    /// PHC-format hash of `password`
    ///
    /// Passwords shorter than the configured minimum fail with
    /// [`Error::PasswordTooWeak`].
    pub fn hash(&self, password: &str) -> Result<String> {
        if password.chars().count() < self.min_length {
            return Err(Error::PasswordTooWeak(format!(
                "password must be at least {} characters",
                self.min_length
            )));
        }

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Internal(format!("failed to hash password: {}", e)))?;

        Ok(hash.to_string())
    }

    /// Constant-time check of `password` against a stored hash
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| {
            tracing::error!(error = %e, "Stored password hash is malformed");
            Error::Internal("stored password hash is malformed".to_string())
        })?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal(format!("password verification failed: {}", e))),
        }
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }
}
