// config.rs — Gateway configuration.
//
// GatewayConfig decides the conformance tier, where the ledger and replay log
// live, and how the classifier and scope checks are tuned. The `for_project()`
// constructor generates defaults under a `.csp/` directory in the project
// root; `load_for_project()` overlays `.csp/gateway.toml` when it exists.
//
// Signing keys never appear here. `signing_key_id` only names the key the
// injected Signer is expected to hold.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use csp_ledger::ConformanceTier;
use csp_policy::{Environment, PatternSpec, RiskLevel, SymlinkPolicy};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Name of the configuration file inside `.csp/`.
pub const CONFIG_FILE: &str = "gateway.toml";

/// Configuration for the gatekeeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Conformance tier: basic, standard, or court_grade.
    #[serde(default)]
    pub tier: ConformanceTier,

    /// Deployment environment. Only development admits provisional law changes.
    #[serde(default)]
    pub environment: Environment,

    /// Append-only JSONL receipt ledger.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Consumed single-use token keys.
    #[serde(default = "default_replay_log_path")]
    pub replay_log_path: PathBuf,

    /// How long to wait for a Guardian verdict before treating it as absent.
    #[serde(default = "default_guardian_timeout_ms")]
    pub guardian_timeout_ms: u64,

    /// Plans older than this stop authorizing actions. Unset means no expiry.
    #[serde(default)]
    pub plan_ttl_secs: Option<u64>,

    #[serde(default)]
    pub symlink_policy: SymlinkPolicy,

    /// Additional deny patterns on top of the built-in default set.
    #[serde(default)]
    pub extra_patterns: Vec<PatternSpec>,

    /// Baseline risk per tool name.
    #[serde(default)]
    pub tool_risk: HashMap<String, RiskLevel>,

    /// Key id the injected signer must report.
    #[serde(default)]
    pub signing_key_id: Option<String>,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".csp").join("receipts.jsonl")
}

fn default_replay_log_path() -> PathBuf {
    PathBuf::from(".csp").join("replay.log")
}

fn default_guardian_timeout_ms() -> u64 {
    5_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tier: ConformanceTier::default(),
            environment: Environment::default(),
            ledger_path: default_ledger_path(),
            replay_log_path: default_replay_log_path(),
            guardian_timeout_ms: default_guardian_timeout_ms(),
            plan_ttl_secs: None,
            symlink_policy: SymlinkPolicy::default(),
            extra_patterns: Vec::new(),
            tool_risk: HashMap::new(),
            signing_key_id: None,
        }
    }
}

impl GatewayConfig {
    /// Create a config with the standard `.csp/` layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        Self::default().rooted_at(project_root.as_ref())
    }

    /// Load `.csp/gateway.toml` under `project_root`, falling back to the
    /// defaults when the file does not exist.
    pub fn load_for_project(project_root: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let root = project_root.as_ref();
        let path = root.join(".csp").join(CONFIG_FILE);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no gateway config, using defaults");
            return Ok(Self::for_project(root));
        }
        Ok(Self::load(&path)?.rooted_at(root))
    }

    /// Parse a TOML configuration file. Relative paths are kept as written.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path).map_err(|e| GatewayError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: GatewayConfig = toml::from_str(&content).map_err(|e| GatewayError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate(path)?;
        tracing::info!(
            path = %path.display(),
            tier = %config.tier,
            environment = ?config.environment,
            "gateway config loaded"
        );
        Ok(config)
    }

    /// Guardian timeout as a std duration.
    pub fn guardian_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.guardian_timeout_ms)
    }

    /// Plan TTL, if configured.
    pub fn plan_ttl(&self) -> Option<chrono::Duration> {
        self.plan_ttl_secs
            .map(|secs| chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }

    fn rooted_at(mut self, root: &Path) -> Self {
        if self.ledger_path.is_relative() {
            self.ledger_path = root.join(&self.ledger_path);
        }
        if self.replay_log_path.is_relative() {
            self.replay_log_path = root.join(&self.replay_log_path);
        }
        self
    }

    fn validate(&self, path: &Path) -> Result<(), GatewayError> {
        let invalid = |reason: String| GatewayError::Config {
            path: path.to_path_buf(),
            reason,
        };
        if self.guardian_timeout_ms == 0 {
            return Err(invalid("guardian_timeout_ms must be positive".to_string()));
        }
        if self.plan_ttl_secs == Some(0) {
            return Err(invalid("plan_ttl_secs must be positive when set".to_string()));
        }
        if self.tier.requires_signatures() && self.signing_key_id.is_none() {
            return Err(invalid(format!(
                "tier {} requires signing_key_id",
                self.tier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn for_project_uses_csp_layout() {
        let config = GatewayConfig::for_project("/work/repo");
        assert_eq!(config.ledger_path, PathBuf::from("/work/repo/.csp/receipts.jsonl"));
        assert_eq!(config.replay_log_path, PathBuf::from("/work/repo/.csp/replay.log"));
        assert_eq!(config.tier, ConformanceTier::Standard);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.symlink_policy, SymlinkPolicy::Refuse);
        assert_eq!(config.guardian_timeout_ms, 5_000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::load_for_project(dir.path()).unwrap();
        assert_eq!(config, GatewayConfig::for_project(dir.path()));
    }

    #[test]
    fn toml_overrides_are_applied() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".csp")).unwrap();
        std::fs::write(
            dir.path().join(".csp").join(CONFIG_FILE),
            r#"
tier = "court_grade"
environment = "development"
ledger_path = "audit/ledger.jsonl"
guardian_timeout_ms = 250
plan_ttl_secs = 600
symlink_policy = "resolve"
signing_key_id = "hmac-2026-10"

[tool_risk]
shell = "HIGH"
read_file = "LOW"

[[extra_patterns]]
id = "force_push"
pattern = "git\\s+push\\s+.*--force"
description = "force-push rewrites shared history"
safer_alternative = "push to a new branch instead"
"#,
        )
        .unwrap();

        let config = GatewayConfig::load_for_project(dir.path()).unwrap();
        assert_eq!(config.tier, ConformanceTier::CourtGrade);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.ledger_path, dir.path().join("audit/ledger.jsonl"));
        assert_eq!(config.replay_log_path, dir.path().join(".csp/replay.log"));
        assert_eq!(config.guardian_timeout(), std::time::Duration::from_millis(250));
        assert_eq!(config.plan_ttl(), Some(chrono::Duration::seconds(600)));
        assert_eq!(config.symlink_policy, SymlinkPolicy::Resolve);
        assert_eq!(config.tool_risk.get("shell"), Some(&RiskLevel::High));
        assert_eq!(config.extra_patterns.len(), 1);
        assert_eq!(config.extra_patterns[0].id, "force_push");
    }

    #[test]
    fn malformed_or_inconsistent_files_are_config_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        std::fs::write(&path, "tier = \"platinum\"").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config { .. })
        ));

        std::fs::write(&path, "guardian_timeout_ms = 0").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config { .. })
        ));

        std::fs::write(&path, "tier = \"court_grade\"").unwrap();
        let err = GatewayConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("signing_key_id"));
    }
}
