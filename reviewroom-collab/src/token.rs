//! Signed, short-lived connection tokens.
//!
//! Wire format:
//! ```text
//! ┌────────────────────────────┬───┬──────────────────────────────┐
//! │ base64url(claims JSON)     │ . │ hex(HMAC-SHA256(claims JSON))│
//! └────────────────────────────┴───┴──────────────────────────────┘
//! ```
//!
//! A token is a capability, not a login: it authorizes one WebSocket
//! connection to one session (or, for the bearer class, to any session the
//! user is a member of) with a fixed role, until it expires.
//!
//! Verification collapses every failure — malformed, bad signature, wrong
//! class, expired — into a single opaque [`InvalidToken`]. Callers cannot
//! distinguish the causes; the internal reason is exposed only through
//! [`InvalidToken::reason`] for logging.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Env var holding the signing secret.
pub const SECRET_ENV: &str = "REVIEWROOM_TOKEN_SECRET";
/// Env var overriding the token TTL in seconds.
pub const TTL_ENV: &str = "REVIEWROOM_TOKEN_TTL_SECONDS";

/// Default TTL for session-scoped tokens (15 minutes).
pub const DEFAULT_TTL_SECONDS: i64 = 900;

/// Secrets shorter than this are rejected at startup.
const MIN_SECRET_BYTES: usize = 16;

/// The placeholder secret that must never reach a real deployment.
const PLACEHOLDER_SECRET: &str = "dev-ws-secret";

/// Participant role carried in token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Editor,
    Observer,
    Admin,
}

impl Role {
    /// Whether this role may publish layout edits.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Editor | Role::Admin)
    }

    /// Parse a role string, case-insensitively. `VIEWER` is accepted as an
    /// alias of `OBSERVER`.
    pub fn parse(value: &str) -> Option<Role> {
        match value.trim().to_ascii_uppercase().as_str() {
            "EDITOR" => Some(Role::Editor),
            "OBSERVER" | "VIEWER" => Some(Role::Observer),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Editor => write!(f, "EDITOR"),
            Role::Observer => write!(f, "OBSERVER"),
            Role::Admin => write!(f, "ADMIN"),
        }
    }
}

/// Token class tag inside the claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Scoped to exactly one session.
    Session,
    /// Scoped to all sessions the user is a member of; carries no session id.
    Bearer,
}

/// Verified claim set. Never persisted — reconstructed from the token
/// string on every verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub kind: TokenKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub user_id: String,
    pub role: Role,
    /// Absolute expiry, seconds since the Unix epoch.
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

/// A freshly minted token plus its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: i64,
}

/// Token service configuration.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Shared signing secret.
    pub secret: String,
    /// TTL applied at mint time. Signed so tests can mint expired tokens.
    pub ttl_seconds: i64,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }

    /// Override the TTL.
    pub fn ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Read config from the environment. Missing secret is a hard error —
    /// there is deliberately no fallback value.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret = std::env::var(SECRET_ENV).map_err(|_| TokenError::MissingSecret)?;
        let ttl_seconds = std::env::var(TTL_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECONDS);
        Ok(Self {
            secret,
            ttl_seconds,
        })
    }

    /// Fixed secret for tests.
    pub fn for_testing() -> Self {
        Self::new("test-secret-0123456789abcdef")
    }
}

/// Configuration and minting errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// `REVIEWROOM_TOKEN_SECRET` is not set.
    MissingSecret,
    /// Secret is empty, too short, or a well-known placeholder. Fatal at
    /// startup rather than a silent security hole.
    InsecureSecret,
    /// Claims failed to serialize.
    Encoding(String),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::MissingSecret => {
                write!(f, "{SECRET_ENV} environment variable not set")
            }
            TokenError::InsecureSecret => {
                write!(f, "token secret is missing, too short, or a known placeholder")
            }
            TokenError::Encoding(e) => write!(f, "claims encoding failed: {e}"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Why verification failed. Logging/metrics only — never sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Malformed,
    BadSignature,
    WrongKind,
    Expired,
}

/// Opaque verification failure.
///
/// Display is deliberately uniform across all causes: malformed, forged and
/// expired tokens must be indistinguishable to the presenting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidToken {
    reason: InvalidReason,
}

impl InvalidToken {
    fn new(reason: InvalidReason) -> Self {
        Self { reason }
    }

    /// Internal failure cause, for logs only.
    pub fn reason(&self) -> InvalidReason {
        self.reason
    }
}

impl std::fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid token")
    }
}

impl std::error::Error for InvalidToken {}

/// Stateless mint/verify service.
///
/// Built once at startup with its secret and TTL, then injected wherever
/// tokens are issued or checked — no ambient global configuration.
pub struct TokenService {
    mac: HmacSha256,
    ttl_seconds: i64,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        let secret = config.secret.as_bytes();
        // Containment, not equality: a padded placeholder is just as guessable
        if secret.len() < MIN_SECRET_BYTES || config.secret.contains(PLACEHOLDER_SECRET) {
            return Err(TokenError::InsecureSecret);
        }
        let mac =
            HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InsecureSecret)?;
        Ok(Self {
            mac,
            ttl_seconds: config.ttl_seconds,
        })
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    /// Mint a session-scoped token.
    pub fn mint(
        &self,
        session_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<MintedToken, TokenError> {
        self.mint_claims(Claims {
            kind: TokenKind::Session,
            session_id: Some(session_id.to_string()),
            user_id: user_id.to_string(),
            role,
            expires_at: now_epoch() + self.ttl_seconds,
        })
    }

    /// Mint a bearer token valid for any session the user belongs to.
    pub fn mint_bearer(&self, user_id: &str, role: Role) -> Result<MintedToken, TokenError> {
        self.mint_claims(Claims {
            kind: TokenKind::Bearer,
            session_id: None,
            user_id: user_id.to_string(),
            role,
            expires_at: now_epoch() + self.ttl_seconds,
        })
    }

    fn mint_claims(&self, claims: Claims) -> Result<MintedToken, TokenError> {
        let payload =
            serde_json::to_vec(&claims).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let tag = self.sign(&payload);
        Ok(MintedToken {
            token: format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), hex::encode(tag)),
            expires_at: claims.expires_at,
        })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }

    /// Verify a token against the expected class.
    ///
    /// Steps: split payload from tag, recompute the tag, compare in
    /// constant time, then check expiry and class. Any failure yields the
    /// same opaque [`InvalidToken`].
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, InvalidToken> {
        self.verify_at(token, expected, now_epoch())
    }

    fn verify_at(
        &self,
        token: &str,
        expected: TokenKind,
        now: i64,
    ) -> Result<Claims, InvalidToken> {
        let (payload_b64, tag_hex) = token
            .split_once('.')
            .ok_or_else(|| InvalidToken::new(InvalidReason::Malformed))?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| InvalidToken::new(InvalidReason::Malformed))?;
        let tag =
            hex::decode(tag_hex).map_err(|_| InvalidToken::new(InvalidReason::Malformed))?;

        // Mac::verify_slice compares in constant time
        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&tag)
            .map_err(|_| InvalidToken::new(InvalidReason::BadSignature))?;

        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|_| InvalidToken::new(InvalidReason::Malformed))?;

        if claims.expires_at < now {
            return Err(InvalidToken::new(InvalidReason::Expired));
        }
        if claims.kind != expected {
            return Err(InvalidToken::new(InvalidReason::WrongKind));
        }
        // A session token without a session id has the wrong shape for its class
        if claims.kind == TokenKind::Session && claims.session_id.is_none() {
            return Err(InvalidToken::new(InvalidReason::Malformed));
        }
        Ok(claims)
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
