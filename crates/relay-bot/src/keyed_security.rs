use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use relay_cli::DEFAULT_SECRET_KEY;
use relay_contract::{SecurityCheckError, SecurityInitError, SecurityProvider};
use sha2::{Digest, Sha256};
use tracing::info;

pub(crate) const MIN_SECRET_KEY_CHARS: usize = 12;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Session-scoped key fingerprint. The raw key is never logged.
pub(crate) fn key_fingerprint(secret_key: &str, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0_u8]);
    hasher.update(secret_key.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Security collaborator that derives a key fingerprint at startup and refuses
/// to launch with a weak or default key.
pub(crate) struct KeyedSecurity {
    secret_key: String,
    session_id: String,
    fingerprint: Mutex<Option<String>>,
}

impl KeyedSecurity {
    pub(crate) fn new(secret_key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            session_id: session_id.into(),
            fingerprint: Mutex::new(None),
        }
    }

    pub(crate) fn fingerprint(&self) -> Option<String> {
        lock(&self.fingerprint).clone()
    }
}

#[async_trait]
impl SecurityProvider for KeyedSecurity {
    async fn initialize(&self) -> Result<(), SecurityInitError> {
        if self.secret_key.trim().is_empty() {
            return Err(SecurityInitError("secret key is empty".to_string()));
        }
        let fingerprint = key_fingerprint(&self.secret_key, &self.session_id);
        info!(key_fingerprint = %fingerprint, "credential store initialized");
        *lock(&self.fingerprint) = Some(fingerprint);
        Ok(())
    }

    async fn pre_launch_check(&self) -> Result<(), SecurityCheckError> {
        if self.fingerprint().is_none() {
            return Err(SecurityCheckError(
                "credential store was not initialized".to_string(),
            ));
        }
        if self.secret_key == DEFAULT_SECRET_KEY {
            return Err(SecurityCheckError(
                "secret key is still the shipped default".to_string(),
            ));
        }
        if self.secret_key.chars().count() < MIN_SECRET_KEY_CHARS {
            return Err(SecurityCheckError(format!(
                "secret key must be at least {MIN_SECRET_KEY_CHARS} characters"
            )));
        }
        Ok(())
    }
}
