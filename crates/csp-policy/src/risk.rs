// risk.rs — Risk levels and the action under evaluation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered risk level. `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    /// HIGH and CRITICAL actions need a plan or a capability token.
    pub fn requires_authorization(self) -> bool {
        self >= RiskLevel::High
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            "CRITICAL" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level '{}'", other)),
        }
    }
}

/// A proposed side-effecting tool action. Constructed per request and only
/// persisted inside receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAction {
    /// Tool identity (e.g. "shell", "fs.delete", "db.exec").
    pub tool: String,
    /// Command text, when the tool takes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// What the action touches: an absolute path, a `scheme://` URI, or an opaque name.
    pub target_scope: String,
    /// The caller's own risk estimate. A hint only; it can raise but never lower.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_risk: Option<RiskLevel>,
}

impl ToolAction {
    pub fn new(tool: impl Into<String>, target_scope: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            command: None,
            target_scope: target_scope.into(),
            requested_risk: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_requested_risk(mut self, risk: RiskLevel) -> Self {
        self.requested_risk = Some(risk);
        self
    }
}
