// capability.rs — Proof-carrying capability (PCCap) tokens.
//
// A PCCap token is a pre-issued, signed, scoped, expiring grant that stands in
// for a fresh Guardian call. Validation runs six checks in a fixed order and
// stops at the first failure:
//
// 1. Signature over the canonical unsigned payload → SIGNATURE_INVALID
// 2. token_id not revoked                          → REVOKED
// 3. now <= expires_at                             → EXPIRED
// 4. token principal == acting principal           → PRINCIPAL_MISMATCH
// 5. exact tool match plus scope containment       → SCOPE_MISMATCH
// 6. single-use replay test-and-set                → REPLAY
//
// Step 6 is the grant itself: the replay store's `consume` atomically checks
// and records the token's replay key, so two concurrent redemptions cannot
// both succeed. If the replay store cannot be written the token is denied.

use std::collections::HashSet;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use csp_ledger::hasher::{hash_bytes, to_canonical_json};
use csp_ledger::signer::{decode_signature, encode_signature};
use csp_ledger::{SignatureAlgorithm, Signer, Verifier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;
use crate::risk::ToolAction;
use crate::scope::ScopeEnforcer;

/// A signed capability grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcCapToken {
    pub token_id: String,
    pub principal: String,
    pub tool: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub issued_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub single_use: bool,
    pub nonce: String,
    pub key_id: String,
    pub algorithm: SignatureAlgorithm,
    /// Base64 signature over [`PcCapToken::signing_bytes`].
    pub signature: String,
}

/// The signed portion of a token: every field except `signature`.
#[derive(Serialize)]
struct TokenClaims<'a> {
    token_id: &'a str,
    principal: &'a str,
    tool: &'a str,
    scope: &'a str,
    issued_at: &'a DateTime<Utc>,
    expires_at: &'a DateTime<Utc>,
    issued_by: &'a str,
    policy_id: &'a Option<String>,
    single_use: bool,
    nonce: &'a str,
    key_id: &'a str,
    algorithm: SignatureAlgorithm,
}

impl PcCapToken {
    fn claims(&self) -> TokenClaims<'_> {
        TokenClaims {
            token_id: &self.token_id,
            principal: &self.principal,
            tool: &self.tool,
            scope: &self.scope,
            issued_at: &self.issued_at,
            expires_at: &self.expires_at,
            issued_by: &self.issued_by,
            policy_id: &self.policy_id,
            single_use: self.single_use,
            nonce: &self.nonce,
            key_id: &self.key_id,
            algorithm: self.algorithm,
        }
    }

    /// Canonical JSON of the unsigned payload.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, PolicyError> {
        Ok(to_canonical_json(&self.claims())?.into_bytes())
    }

    /// Stable replay identifier: SHA-256 of the canonical unsigned payload.
    pub fn replay_key(&self) -> Result<String, PolicyError> {
        Ok(hash_bytes(&self.signing_bytes()?))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// What the issuer is asked to grant.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub principal: String,
    pub tool: String,
    pub scope: String,
    pub ttl: Duration,
    pub single_use: bool,
    pub policy_id: Option<String>,
}

impl TokenRequest {
    /// A single-use grant valid for five minutes.
    pub fn new(
        principal: impl Into<String>,
        tool: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            tool: tool.into(),
            scope: scope.into(),
            ttl: Duration::minutes(5),
            single_use: true,
            policy_id: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn reusable(mut self) -> Self {
        self.single_use = false;
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }
}

/// Mints tokens through an injected signer.
pub struct CapabilityIssuer {
    signer: Arc<dyn Signer>,
    issued_by: String,
}

impl CapabilityIssuer {
    pub fn new(signer: Arc<dyn Signer>, issued_by: impl Into<String>) -> Self {
        Self {
            signer,
            issued_by: issued_by.into(),
        }
    }

    pub fn mint(&self, request: TokenRequest) -> Result<PcCapToken, PolicyError> {
        let issued_at = Utc::now();
        let mut token = PcCapToken {
            token_id: format!("pccap_{}", Uuid::new_v4().simple()),
            principal: request.principal,
            tool: request.tool,
            scope: request.scope,
            issued_at,
            expires_at: issued_at + request.ttl,
            issued_by: self.issued_by.clone(),
            policy_id: request.policy_id,
            single_use: request.single_use,
            nonce: Uuid::new_v4().simple().to_string(),
            key_id: self.signer.key_id().to_string(),
            algorithm: self.signer.algorithm(),
            signature: String::new(),
        };
        let signature = self.signer.sign(&token.signing_bytes()?)?;
        token.signature = encode_signature(&signature);

        tracing::info!(
            token_id = %token.token_id,
            principal = %token.principal,
            tool = %token.tool,
            scope = %token.scope,
            expires_at = %token.expires_at,
            single_use = token.single_use,
            "capability token minted"
        );
        Ok(token)
    }
}

/// Consumed-token set plus revoked token ids. `consume` is an atomic
/// test-and-set.
pub trait ReplayStore: Send + Sync {
    /// Record `key` as consumed. Returns `Ok(true)` if it was not consumed
    /// before, `Ok(false)` if it was. Must not return `Ok(true)` until the
    /// record is durable.
    fn consume(&self, key: &str) -> Result<bool, PolicyError>;

    fn is_consumed(&self, key: &str) -> Result<bool, PolicyError>;

    /// Revoke a token by id. Returns `Ok(false)` if it was already revoked.
    /// Must not return until the revocation is durable.
    fn revoke(&self, token_id: &str) -> Result<bool, PolicyError>;

    fn is_revoked(&self, token_id: &str) -> Result<bool, PolicyError>;
}

/// Replay store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryReplayStore {
    consumed: Mutex<HashSet<String>>,
    revoked: Mutex<HashSet<String>>,
}

impl MemoryReplayStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplayStore for MemoryReplayStore {
    fn consume(&self, key: &str) -> Result<bool, PolicyError> {
        let mut consumed = self.consumed.lock().map_err(|_| PolicyError::LockPoisoned)?;
        Ok(consumed.insert(key.to_string()))
    }

    fn is_consumed(&self, key: &str) -> Result<bool, PolicyError> {
        let consumed = self.consumed.lock().map_err(|_| PolicyError::LockPoisoned)?;
        Ok(consumed.contains(key))
    }

    fn revoke(&self, token_id: &str) -> Result<bool, PolicyError> {
        let mut revoked = self.revoked.lock().map_err(|_| PolicyError::LockPoisoned)?;
        Ok(revoked.insert(token_id.to_string()))
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool, PolicyError> {
        let revoked = self.revoked.lock().map_err(|_| PolicyError::LockPoisoned)?;
        Ok(revoked.contains(token_id))
    }
}

/// Prefix marking a revocation line in the replay log. Replay keys are hex,
/// so they never collide with it.
const REVOKED_PREFIX: &str = "revoked ";

struct FileReplayState {
    consumed: HashSet<String>,
    revoked: HashSet<String>,
    file: File,
}

impl FileReplayState {
    fn append(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.file, "{}", line)?;
        self.file.sync_data()
    }
}

/// Append-only replay log, one entry per line, fsynced before a consume or
/// revocation succeeds and replayed on open so both survive restarts.
pub struct FileReplayStore {
    path: PathBuf,
    state: Mutex<FileReplayState>,
}

impl FileReplayStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |e: std::io::Error| PolicyError::ReplayStoreUnavailable {
            reason: format!("{}: {}", path.display(), e),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(unavailable)?;
            }
        }

        let mut consumed = HashSet::new();
        let mut revoked = HashSet::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path).map_err(unavailable)?);
            for line in reader.lines() {
                let line = line.map_err(unavailable)?;
                let entry = line.trim();
                if let Some(token_id) = entry.strip_prefix(REVOKED_PREFIX) {
                    revoked.insert(token_id.to_string());
                } else if !entry.is_empty() {
                    consumed.insert(entry.to_string());
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(unavailable)?;

        tracing::debug!(
            path = %path.display(),
            consumed = consumed.len(),
            revoked = revoked.len(),
            "replay store opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(FileReplayState {
                consumed,
                revoked,
                file,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, e: std::io::Error) -> PolicyError {
        PolicyError::ReplayStoreUnavailable {
            reason: format!("{}: {}", self.path.display(), e),
        }
    }
}

impl ReplayStore for FileReplayStore {
    fn consume(&self, key: &str) -> Result<bool, PolicyError> {
        let mut state = self.state.lock().map_err(|_| PolicyError::LockPoisoned)?;
        if state.consumed.contains(key) {
            return Ok(false);
        }
        state.append(key).map_err(|e| self.unavailable(e))?;
        state.consumed.insert(key.to_string());
        Ok(true)
    }

    fn is_consumed(&self, key: &str) -> Result<bool, PolicyError> {
        let state = self.state.lock().map_err(|_| PolicyError::LockPoisoned)?;
        Ok(state.consumed.contains(key))
    }

    fn revoke(&self, token_id: &str) -> Result<bool, PolicyError> {
        let mut state = self.state.lock().map_err(|_| PolicyError::LockPoisoned)?;
        if state.revoked.contains(token_id) {
            return Ok(false);
        }
        state
            .append(&format!("{}{}", REVOKED_PREFIX, token_id))
            .map_err(|e| self.unavailable(e))?;
        state.revoked.insert(token_id.to_string());
        Ok(true)
    }

    fn is_revoked(&self, token_id: &str) -> Result<bool, PolicyError> {
        let state = self.state.lock().map_err(|_| PolicyError::LockPoisoned)?;
        Ok(state.revoked.contains(token_id))
    }
}

/// Why a token was denied. Serialized with the upstream reason names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    SignatureInvalid,
    Expired,
    PrincipalMismatch,
    ScopeMismatch,
    Replay,
    Revoked,
    ReplayStoreUnavailable,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DenyReason::SignatureInvalid => "SIGNATURE_INVALID",
            DenyReason::Expired => "EXPIRED",
            DenyReason::PrincipalMismatch => "PRINCIPAL_MISMATCH",
            DenyReason::ScopeMismatch => "SCOPE_MISMATCH",
            DenyReason::Replay => "REPLAY",
            DenyReason::Revoked => "REVOKED",
            DenyReason::ReplayStoreUnavailable => "REPLAY_STORE_UNAVAILABLE",
        })
    }
}

/// A denied token, with a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDenial {
    pub reason: DenyReason,
    pub token_id: String,
    pub detail: String,
}

/// A successfully redeemed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub token_id: String,
    pub replay_key: String,
    pub principal: String,
    pub tool: String,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub single_use: bool,
}

/// Verifies and redeems PCCap tokens.
pub struct CapabilityTokenValidator {
    verifier: Arc<dyn Verifier>,
    replay: Arc<dyn ReplayStore>,
    scopes: ScopeEnforcer,
}

impl CapabilityTokenValidator {
    pub fn new(
        verifier: Arc<dyn Verifier>,
        replay: Arc<dyn ReplayStore>,
        scopes: ScopeEnforcer,
    ) -> Self {
        Self {
            verifier,
            replay,
            scopes,
        }
    }

    /// Revoke a token by id. Later redemptions are denied with REVOKED.
    pub fn revoke(&self, token_id: &str) -> Result<bool, PolicyError> {
        let newly = self.replay.revoke(token_id)?;
        tracing::info!(%token_id, newly, "capability token revoked");
        Ok(newly)
    }

    pub fn validate(
        &self,
        token: &PcCapToken,
        action: &ToolAction,
        principal: &str,
    ) -> Result<CapabilityGrant, CapabilityDenial> {
        self.validate_at(token, action, principal, Utc::now())
    }

    /// Validate as of `now`.
    pub fn validate_at(
        &self,
        token: &PcCapToken,
        action: &ToolAction,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<CapabilityGrant, CapabilityDenial> {
        let deny = |reason: DenyReason, detail: String| {
            tracing::warn!(token_id = %token.token_id, %reason, %detail, "capability token denied");
            CapabilityDenial {
                reason,
                token_id: token.token_id.clone(),
                detail,
            }
        };

        // 1. Signature
        let message = token
            .signing_bytes()
            .map_err(|e| deny(DenyReason::SignatureInvalid, e.to_string()))?;
        let signature = decode_signature(&token.signature).ok_or_else(|| {
            deny(
                DenyReason::SignatureInvalid,
                "signature is not valid base64".to_string(),
            )
        })?;
        if !self
            .verifier
            .verify(&token.key_id, token.algorithm, &message, &signature)
        {
            return Err(deny(
                DenyReason::SignatureInvalid,
                format!("signature does not verify under key '{}'", token.key_id),
            ));
        }

        // 2. Revocation
        match self.replay.is_revoked(&token.token_id) {
            Ok(false) => {}
            Ok(true) => {
                return Err(deny(
                    DenyReason::Revoked,
                    format!("token '{}' has been revoked", token.token_id),
                ))
            }
            Err(e) => return Err(deny(DenyReason::ReplayStoreUnavailable, e.to_string())),
        }

        // 3. Expiry
        if token.is_expired_at(now) {
            return Err(deny(
                DenyReason::Expired,
                format!("token expired at {}", token.expires_at.to_rfc3339()),
            ));
        }

        // 4. Principal
        if token.principal != principal {
            return Err(deny(
                DenyReason::PrincipalMismatch,
                format!("token is bound to '{}', not '{}'", token.principal, principal),
            ));
        }

        // 5. Tool and scope
        if token.tool != action.tool {
            return Err(deny(
                DenyReason::ScopeMismatch,
                format!("token grants tool '{}', not '{}'", token.tool, action.tool),
            ));
        }
        if let Err(violation) = self.scopes.contains(&token.scope, &action.target_scope) {
            return Err(deny(DenyReason::ScopeMismatch, violation.detail));
        }

        // 6. Replay (the grant itself for single-use tokens)
        let replay_key = token
            .replay_key()
            .map_err(|e| deny(DenyReason::SignatureInvalid, e.to_string()))?;
        if token.single_use {
            match self.replay.consume(&replay_key) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(deny(
                        DenyReason::Replay,
                        "single-use token was already redeemed".to_string(),
                    ))
                }
                Err(e) => return Err(deny(DenyReason::ReplayStoreUnavailable, e.to_string())),
            }
        }

        tracing::info!(
            token_id = %token.token_id,
            principal = %principal,
            tool = %action.tool,
            scope = %action.target_scope,
            "capability token granted"
        );
        Ok(CapabilityGrant {
            token_id: token.token_id.clone(),
            replay_key,
            principal: token.principal.clone(),
            tool: token.tool.clone(),
            scope: token.scope.clone(),
            expires_at: token.expires_at,
            single_use: token.single_use,
        })
    }
}
