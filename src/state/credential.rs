//! Session credential store
//!
//! The credential is written only by the bind and refresh steps of the bridge
//! lifecycle and read by every outbound backend call. Readers copy the token
//! out under the read lock and never hold it across network I/O.

use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Backend session credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Short-lived access token (JWT) sent as bearer on every call
    pub session_token: String,
    /// Expiry of `session_token`, seconds since the Unix epoch
    pub expires_at: i64,
    /// Long-lived token used to mint new access tokens
    pub refresh_token: String,
    /// Identifier of the refresh token; names the subscription topics
    pub token_id: String,
}

impl Credential {
    /// True when the access token expires in less than `threshold`
    pub fn expires_within(&self, now: i64, threshold: Duration) -> bool {
        self.expires_at - now < threshold.as_secs() as i64
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("session_token", &"***")
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &"***")
            .field("token_id", &self.token_id)
            .finish()
    }
}

/// Holder of the current credential
#[derive(Debug, Default)]
pub struct TokenStore {
    inner: RwLock<Option<Credential>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current credential, if bound
    pub fn snapshot(&self) -> Option<Credential> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current access token
    pub fn bearer(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|credential| credential.session_token.clone())
    }

    /// Identifier of the refresh token
    pub fn token_id(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|credential| credential.token_id.clone())
    }

    pub fn replace(&self, credential: Credential) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// True when unbound or when the token expires within `threshold` of `now`
    pub fn needs_refresh(&self, now: i64, threshold: Duration) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |credential| credential.expires_within(now, threshold))
    }
}
