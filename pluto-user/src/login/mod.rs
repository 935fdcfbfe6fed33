pub mod static_provider;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    Failed,
    #[error("authenticator failure: {0}")]
    Internal(String),
}

/// What a successful login yields: enough to route the session to the
/// worker owning the user.
#[derive(Clone, Debug)]
pub struct UserDescriptor {
    pub username: String,
    pub user_id: u32,
}

/// Seam for the authentication adapters. The flat-file provider lives in
/// this crate; lookups against an external database plug in here.
#[async_trait]
pub trait LoginProvider {
    async fn login(&self, username: &str, password: &str) -> Result<UserDescriptor, AuthError>;
}

pub type ArcLoginProvider = Arc<dyn LoginProvider + Send + Sync>;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Argon2 error: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}
