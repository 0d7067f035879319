//! First-user bootstrap.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::io::atomic_write_private;
use crate::paths;
use crate::registry::{RedbRegistry, UserRecord};

const SALT_LEN: usize = 16;
const GENERATED_PASSWORD_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminBootstrap {
    /// At least one user exists; nothing was created.
    AlreadyPresent,
    Created {
        username: String,
        /// Where the generated password was written, if it was generated.
        password_file: Option<PathBuf>,
    },
}

/// `base64(salt)$base64(sha256(salt ++ password))`
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill(&mut salt);
    encode(&salt, password)
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, _)) = stored.split_once('$') else {
        return false;
    };
    match STANDARD.decode(salt) {
        Ok(salt) => encode(&salt, password) == stored,
        Err(_) => false,
    }
}

fn encode(salt: &[u8], password: &str) -> String {
    let digest = Sha256::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize();
    format!("{}${}", STANDARD.encode(salt), STANDARD.encode(digest))
}

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Create the administrative account when the registry has no users.
///
/// With no `password` a random one is generated and written, owner-readable
/// only, to `<data_dir>/initial-admin-password`. The password is never
/// logged.
pub async fn bootstrap_admin(
    registry: &RedbRegistry,
    data_dir: &Path,
    username: &str,
    password: Option<&str>,
) -> Result<AdminBootstrap> {
    if registry.has_users().await? {
        tracing::debug!("users present, skipping admin bootstrap");
        return Ok(AdminBootstrap::AlreadyPresent);
    }

    let (password, password_file) = match password.filter(|p| !p.is_empty()) {
        Some(p) => (p.to_string(), None),
        None => {
            let generated = generate_password();
            let path = paths::admin_password_path(data_dir);
            atomic_write_private(&path, format!("{generated}\n").as_bytes())?;
            (generated, Some(path))
        }
    };

    let inserted = registry
        .insert_user(UserRecord {
            username: username.to_string(),
            password_hash: hash_password(&password),
            is_admin: true,
            created_at: Utc::now(),
        })
        .await?;
    if !inserted {
        return Ok(AdminBootstrap::AlreadyPresent);
    }

    match &password_file {
        Some(path) => tracing::info!(
            username,
            password_file = %path.display(),
            "created admin user with generated password"
        ),
        None => tracing::info!(username, "created admin user from configured password"),
    }
    Ok(AdminBootstrap::Created {
        username: username.to_string(),
        password_file,
    })
}
