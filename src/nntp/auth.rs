//! AUTHINFO validation (§4.4): a short-lived success cache to avoid hashing
//! on every command, plus a failure counter that temporarily locks an
//! account after too many bad attempts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::config::{AUTH_CACHE_TTL_MINUTES, AUTH_LOCKOUT_SECS, AUTH_MAX_FAILURES};
use crate::error::NntpError;
use crate::storage::catalog::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { can_post: bool },
    InvalidCredentials,
    Locked,
}

struct FailureState {
    count: u32,
    locked_until: Option<Instant>,
}

pub struct AuthGuard {
    catalog: std::sync::Arc<Catalog>,
    cache: moka::future::Cache<String, bool>,
    failures: Mutex<HashMap<String, FailureState>>,
}

/// Hash format stored in `nntp_users.password_hash`: `sha256:<hex>`. The
/// teacher's stack has no dedicated password-hashing crate (auth there is
/// OIDC-delegated); this reuses the digest crate already in the dependency
/// tree rather than pulling in a new one for a single comparison.
pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!("sha256:{:x}", digest)
}

impl AuthGuard {
    pub fn new(catalog: std::sync::Arc<Catalog>) -> Self {
        AuthGuard {
            catalog,
            cache: moka::future::Cache::builder()
                .time_to_live(Duration::from_secs(AUTH_CACHE_TTL_MINUTES * 60))
                .build(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> Result<AuthOutcome, NntpError> {
        {
            let failures = self.failures.lock().unwrap();
            if let Some(state) = failures.get(username) {
                if let Some(until) = state.locked_until {
                    if Instant::now() < until {
                        return Ok(AuthOutcome::Locked);
                    }
                }
            }
        }

        let cache_key = format!("{username}:{}", hash_password(password));
        if self.cache.get(&cache_key).await.is_some() {
            let can_post = self
                .catalog
                .get_user(username)
                .map_err(NntpError::Storage)?
                .map(|u| u.can_post)
                .unwrap_or(false);
            return Ok(AuthOutcome::Accepted { can_post });
        }

        let user = self.catalog.get_user(username).map_err(NntpError::Storage)?;
        let Some(user) = user else {
            self.record_failure(username);
            return Ok(AuthOutcome::InvalidCredentials);
        };
        if !user.active || user.password_hash != hash_password(password) {
            self.record_failure(username);
            return Ok(AuthOutcome::InvalidCredentials);
        }

        self.failures.lock().unwrap().remove(username);
        self.cache.insert(cache_key, true).await;
        let _ = self.catalog.record_login(username);
        Ok(AuthOutcome::Accepted { can_post: user.can_post })
    }

    fn record_failure(&self, username: &str) {
        let mut failures = self.failures.lock().unwrap();
        let state = failures.entry(username.to_string()).or_insert(FailureState {
            count: 0,
            locked_until: None,
        });
        state.count += 1;
        if state.count >= AUTH_MAX_FAILURES {
            state.locked_until = Some(Instant::now() + Duration::from_secs(AUTH_LOCKOUT_SECS));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_user_is_rejected_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = std::sync::Arc::new(Catalog::open(dir.path()).unwrap());
        let guard = AuthGuard::new(catalog);
        let outcome = guard.authenticate("nobody", "whatever").await.unwrap();
        assert_eq!(outcome, AuthOutcome::InvalidCredentials);
    }

    #[tokio::test]
    async fn lockout_after_max_failures() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = std::sync::Arc::new(Catalog::open(dir.path()).unwrap());
        let guard = AuthGuard::new(catalog);
        for _ in 0..AUTH_MAX_FAILURES {
            guard.authenticate("nobody", "wrong").await.unwrap();
        }
        let outcome = guard.authenticate("nobody", "wrong").await.unwrap();
        assert_eq!(outcome, AuthOutcome::Locked);
    }
}
