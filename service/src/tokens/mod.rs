//! Capability tokens: single-use, time-boxed, reason-scoped authorizations.
//!
//! A token is minted through the encrypted command channel (`save_token`) and
//! presented with an upload. The upload pipeline validates it before the first
//! byte is accepted and consumes it exactly once when the upload completes.

pub mod policy;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use policy::CharsetPolicy;

/// Shortest generated token or passphrase.
pub const MIN_SECRET_LENGTH: usize = 8;
/// Longest generated token or passphrase.
pub const MAX_SECRET_LENGTH: usize = 128;

/// What a capability token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenReason {
    RestoreDb,
}

impl TokenReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RestoreDb => "restore_db",
        }
    }
}

impl fmt::Display for TokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenReason {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restore_db" => Ok(Self::RestoreDb),
            other => Err(TokenError::InvalidPolicy(format!(
                "unrecognized reason '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token policy: {0}")]
    InvalidPolicy(String),
    #[error("token expired")]
    Expired,
    #[error("token not valid for this operation")]
    WrongReason,
    #[error("token already used")]
    AlreadyConsumed,
    #[error("unknown token")]
    Unknown,
    #[error("token store unavailable")]
    Unavailable,
}

/// Server-side record of a minted token.
#[derive(Debug, Clone)]
pub struct CapabilityToken {
    pub id: String,
    pub reason: TokenReason,
    pub policy: CharsetPolicy,
    pub issued_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub consumed: bool,
}

impl CapabilityToken {
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::minutes(self.duration_minutes)
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// What the caller receives from `save_token`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token_id: String,
    pub reason: TokenReason,
    pub expires_at: DateTime<Utc>,
}

/// Short non-reversible tag for logging a token without revealing it.
#[must_use]
pub fn fingerprint(token_id: &str) -> String {
    let digest = Sha256::digest(token_id.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Mints, validates and consumes capability tokens.
pub struct TokenIssuer {
    tokens: Mutex<HashMap<String, CapabilityToken>>,
    max_duration_minutes: i64,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(max_duration_minutes: i64) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            max_duration_minutes,
        }
    }

    /// Mint a token for `reason`, valid for `duration_minutes`.
    ///
    /// # Errors
    /// Returns [`TokenError::InvalidPolicy`] for a non-positive or over-long
    /// duration, or a charset policy with an out-of-range length.
    pub fn mint(
        &self,
        reason: TokenReason,
        duration_minutes: i64,
        policy: &CharsetPolicy,
    ) -> Result<TokenGrant, TokenError> {
        self.mint_at(reason, duration_minutes, policy, Utc::now())
    }

    /// [`Self::mint`] with an explicit issuance time.
    ///
    /// # Errors
    /// See [`Self::mint`].
    pub fn mint_at(
        &self,
        reason: TokenReason,
        duration_minutes: i64,
        policy: &CharsetPolicy,
        now: DateTime<Utc>,
    ) -> Result<TokenGrant, TokenError> {
        if duration_minutes <= 0 {
            return Err(TokenError::InvalidPolicy(
                "duration must be positive".to_string(),
            ));
        }
        if duration_minutes > self.max_duration_minutes {
            return Err(TokenError::InvalidPolicy(format!(
                "duration exceeds maximum of {} minutes",
                self.max_duration_minutes
            )));
        }

        let mut map = self.tokens.lock().map_err(|_| TokenError::Unavailable)?;
        // A collision is astronomically unlikely; redraw rather than overwrite.
        let id = loop {
            let candidate = policy.generate()?;
            if !map.contains_key(&candidate) {
                break candidate;
            }
        };

        let token = CapabilityToken {
            id: id.clone(),
            reason,
            policy: *policy,
            issued_at: now,
            duration_minutes,
            consumed: false,
        };
        let grant = TokenGrant {
            token_id: id.clone(),
            reason,
            expires_at: token.expires_at(),
        };
        map.insert(id, token);

        tracing::info!(
            token = %fingerprint(&grant.token_id),
            reason = %reason,
            duration_minutes,
            "minted capability token"
        );
        Ok(grant)
    }

    /// Check a token against `reason` without side effects.
    ///
    /// Checks run in order: unknown, expired, wrong reason, consumed.
    ///
    /// # Errors
    /// Returns the first failing check as a [`TokenError`].
    pub fn validate(&self, token_id: &str, reason: TokenReason) -> Result<(), TokenError> {
        self.validate_at(token_id, reason, Utc::now())
    }

    /// [`Self::validate`] at an explicit point in time.
    ///
    /// # Errors
    /// See [`Self::validate`].
    pub fn validate_at(
        &self,
        token_id: &str,
        reason: TokenReason,
        now: DateTime<Utc>,
    ) -> Result<(), TokenError> {
        let map = self.tokens.lock().map_err(|_| TokenError::Unavailable)?;
        let token = map.get(token_id).ok_or(TokenError::Unknown)?;
        if token.is_expired(now) {
            return Err(TokenError::Expired);
        }
        if token.reason != reason {
            return Err(TokenError::WrongReason);
        }
        if token.consumed {
            return Err(TokenError::AlreadyConsumed);
        }
        Ok(())
    }

    /// When a token stops being valid.
    ///
    /// # Errors
    /// Returns [`TokenError::Unknown`] if the token does not exist.
    pub fn expires_at(&self, token_id: &str) -> Result<DateTime<Utc>, TokenError> {
        let map = self.tokens.lock().map_err(|_| TokenError::Unavailable)?;
        map.get(token_id)
            .map(CapabilityToken::expires_at)
            .ok_or(TokenError::Unknown)
    }

    /// Mark a token consumed. Exactly one of any number of racing callers succeeds.
    ///
    /// # Errors
    /// Returns [`TokenError::Expired`] past the token's expiry,
    /// [`TokenError::AlreadyConsumed`] on a second call, or
    /// [`TokenError::Unknown`] if the token does not exist.
    pub fn consume(&self, token_id: &str) -> Result<(), TokenError> {
        self.consume_at(token_id, Utc::now())
    }

    /// [`Self::consume`] at an explicit point in time.
    ///
    /// # Errors
    /// See [`Self::consume`].
    pub fn consume_at(&self, token_id: &str, now: DateTime<Utc>) -> Result<(), TokenError> {
        let mut map = self.tokens.lock().map_err(|_| TokenError::Unavailable)?;
        let token = map.get_mut(token_id).ok_or(TokenError::Unknown)?;
        if token.is_expired(now) {
            return Err(TokenError::Expired);
        }
        if token.consumed {
            return Err(TokenError::AlreadyConsumed);
        }
        token.consumed = true;
        tracing::info!(token = %fingerprint(token_id), "consumed capability token");
        Ok(())
    }

    /// Draw a secret (e.g. a backup passphrase) from the same random source.
    ///
    /// # Errors
    /// Returns [`TokenError::InvalidPolicy`] if the policy length is out of range.
    pub fn generate_secret(&self, policy: &CharsetPolicy) -> Result<String, TokenError> {
        policy.generate()
    }

    /// Drop every token past its expiry, consumed or not. Returns how many were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut map) = self.tokens.lock() else {
            return 0;
        };
        let before = map.len();
        map.retain(|_, token| !token.is_expired(now));
        before - map.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.lock().map_or(0, |map| map.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
