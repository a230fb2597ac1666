//! Credential guard.
//!
//! Holds the provisioning token and decides, before every outbound call,
//! whether it can still be used. Expiry is read from the token's `exp` claim
//! and never verified; anything that fails to decode is treated as already
//! expired.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::CallError;

/// Externally supplied hook that produces a replacement token.
///
/// Any `Fn() -> impl Future<Output = Option<String>>` closure implements it.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Option<String>;
}

#[async_trait]
impl<F, Fut> TokenRefresher for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Option<String>> + Send,
{
    async fn refresh(&self) -> Option<String> {
        (self)().await
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenDecodeError {
    #[error("token is not made of three dot-separated segments")]
    Shape,
    #[error("claims segment is not base64url")]
    Base64,
    #[error("claims segment is not a json object with a numeric exp")]
    Claims,
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: f64,
}

/// Decodes the `exp` claim of a JWT-shaped token, in milliseconds since epoch.
pub fn decode_expiry(token: &str) -> Result<u64, TokenDecodeError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(claims), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenDecodeError::Shape);
    };

    let raw = URL_SAFE_NO_PAD
        .decode(claims)
        .or_else(|_| URL_SAFE.decode(claims))
        .map_err(|_| TokenDecodeError::Base64)?;
    let claims: ExpiryClaims =
        serde_json::from_slice(&raw).map_err(|_| TokenDecodeError::Claims)?;
    if !claims.exp.is_finite() || claims.exp < 0.0 {
        return Err(TokenDecodeError::Claims);
    }
    Ok((claims.exp * 1000.0) as u64)
}

/// Token plus its decoded expiry.
#[derive(Clone, Debug)]
pub struct Credential {
    token: SecretString,
    expires_at_ms: Option<u64>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at_ms = match decode_expiry(&token) {
            Ok(expiry) => Some(expiry),
            Err(err) => {
                warn!(event = "credential_decode_failed", error = %err);
                None
            }
        };
        Self {
            token: SecretString::new(token),
            expires_at_ms,
        }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// `None` when the token could not be decoded.
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.expires_at_ms
    }

    /// Fails closed: an undecodable token is always expired.
    pub fn is_expired(&self, now_ms: u64, skew: Duration) -> bool {
        match self.expires_at_ms {
            Some(expiry) => now_ms.saturating_add(skew.as_millis() as u64) >= expiry,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    credential: Option<Credential>,
    /// The agent acknowledged `credential`.
    announced: bool,
}

/// Gatekeeper that owns the current credential.
///
/// Checking, refreshing and announcing a token to the agent run under one
/// async gate, so concurrent callers that find the same expired token share
/// a single refresh and a single announcement.
pub struct CredentialGuard {
    slot: Mutex<Slot>,
    gate: AsyncMutex<()>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    clock: Arc<dyn Clock>,
    skew: Duration,
}

impl std::fmt::Debug for CredentialGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGuard")
            .field("slot", &self.slot)
            .field("has_refresher", &self.refresher.is_some())
            .field("skew", &self.skew)
            .finish()
    }
}

impl CredentialGuard {
    pub fn new(
        refresher: Option<Arc<dyn TokenRefresher>>,
        clock: Arc<dyn Clock>,
        skew: Duration,
    ) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            gate: AsyncMutex::new(()),
            refresher,
            clock,
            skew,
        }
    }

    /// Replaces the credential. The agent has not seen it yet.
    pub fn install(&self, token: impl Into<String>) {
        let credential = Credential::new(token);
        debug!(
            event = "credential_installed",
            expires_at_ms = credential.expires_at_ms()
        );
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Slot {
                credential: Some(credential),
                announced: false,
            };
        }
    }

    pub fn current_token(&self) -> Option<SecretString> {
        self.slot.lock().ok().and_then(|slot| {
            slot.credential
                .as_ref()
                .map(|credential| credential.token().clone())
        })
    }

    pub fn has_credential(&self) -> bool {
        self.current_token().is_some()
    }

    /// Gate for ordinary calls.
    ///
    /// Passes when nothing is installed or the agent holds a live token.
    /// Otherwise a live token (the refresh hook's replacement if the current
    /// one expired) goes to `announce`; the call may proceed only once that
    /// succeeds. A failed announcement is retried by the next call.
    pub async fn authorize<A, Fut>(&self, announce: A) -> Result<(), CallError>
    where
        A: FnOnce(SecretString) -> Fut,
        Fut: Future<Output = Result<(), CallError>>,
    {
        if self.is_ready() {
            return Ok(());
        }
        let _gate = self.gate.lock().await;
        if self.is_ready() {
            debug!(event = "credential_settled_by_other_caller");
            return Ok(());
        }
        let token = self.live_token().await?;
        self.announce_with(token, announce).await
    }

    /// Installs `token` and hands a live token to `send`.
    ///
    /// An expired `token` is swapped for the refresh hook's replacement;
    /// without one nothing is sent and the result is `TokenExpired`.
    pub async fn provision<S, Fut>(&self, token: impl Into<String>, send: S) -> Result<(), CallError>
    where
        S: FnOnce(SecretString) -> Fut,
        Fut: Future<Output = Result<(), CallError>>,
    {
        let _gate = self.gate.lock().await;
        self.install(token);
        let token = self.live_token().await?;
        self.announce_with(token, send).await
    }

    /// Re-sends the installed credential to an agent that lost it, under the
    /// same expiry rule as [`CredentialGuard::provision`].
    ///
    /// Returns `Ok(false)` when nothing is installed.
    pub async fn reprovision<S, Fut>(&self, send: S) -> Result<bool, CallError>
    where
        S: FnOnce(SecretString) -> Fut,
        Fut: Future<Output = Result<(), CallError>>,
    {
        let _gate = self.gate.lock().await;
        if !self.has_credential() {
            return Ok(false);
        }
        let token = self.live_token().await?;
        self.announce_with(token, send).await?;
        Ok(true)
    }

    fn is_ready(&self) -> bool {
        let now_ms = self.clock.now_ms();
        match self.slot.lock() {
            Ok(slot) => match slot.credential.as_ref() {
                Some(credential) => slot.announced && !credential.is_expired(now_ms, self.skew),
                None => true,
            },
            Err(_) => false,
        }
    }

    async fn announce_with<S, Fut>(&self, token: SecretString, send: S) -> Result<(), CallError>
    where
        S: FnOnce(SecretString) -> Fut,
        Fut: Future<Output = Result<(), CallError>>,
    {
        send(token.clone()).await?;
        if let Ok(mut slot) = self.slot.lock() {
            let still_current = slot.credential.as_ref().is_some_and(|credential| {
                credential.token().expose_secret() == token.expose_secret()
            });
            if still_current {
                slot.announced = true;
            }
        }
        Ok(())
    }

    /// The installed token while it is valid, otherwise the refresh hook's
    /// replacement, installed unannounced.
    async fn live_token(&self) -> Result<SecretString, CallError> {
        let now_ms = self.clock.now_ms();
        let current = match self.slot.lock() {
            Ok(slot) => slot
                .credential
                .as_ref()
                .filter(|credential| !credential.is_expired(now_ms, self.skew))
                .map(|credential| credential.token().clone()),
            Err(_) => None,
        };
        if let Some(token) = current {
            return Ok(token);
        }

        let Some(refresher) = self.refresher.as_ref() else {
            warn!(event = "credential_expired", refresher = false);
            return Err(CallError::TokenExpired);
        };
        let Some(token) = refresher.refresh().await else {
            warn!(event = "credential_refresh_empty");
            return Err(CallError::TokenExpired);
        };
        let replacement = Credential::new(token);
        if replacement.is_expired(self.clock.now_ms(), self.skew) {
            warn!(event = "credential_refresh_unusable");
            return Err(CallError::TokenExpired);
        }

        info!(
            event = "credential_refreshed",
            expires_at_ms = replacement.expires_at_ms()
        );
        let token = replacement.token().clone();
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Slot {
                credential: Some(replacement),
                announced: false,
            };
        }
        Ok(token)
    }
}
