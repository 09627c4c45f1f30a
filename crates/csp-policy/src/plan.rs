// plan.rs — Tool plans and their canonical hashes.
//
// A plan exists only once its ToolPlan receipt is durable: `create_plan`
// appends the receipt before handing the plan back. Plans are immutable after
// creation. Changing a step means `supersede`, which issues a new plan_id and
// retires the old one, so a verdict bound to the old hash can never cover
// the new steps.
//
// Plans live in memory but the ledger is the source of truth: `restore`
// rebuilds them from ToolPlan receipts when a gateway reopens a ledger.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use csp_ledger::{canonical_hash, Receipt, ReceiptKind, ReceiptLedger, Temporal};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PolicyError;
use crate::receipts;
use crate::risk::{RiskLevel, ToolAction};

/// One intended tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub scope: String,
    /// Risk ceiling for this step.
    pub risk: RiskLevel,
}

impl PlanStep {
    pub fn new(tool: impl Into<String>, scope: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            tool: tool.into(),
            command: None,
            scope: scope.into(),
            risk,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// The step as an action, for classification.
    pub fn to_action(&self) -> ToolAction {
        ToolAction {
            tool: self.tool.clone(),
            command: self.command.clone(),
            target_scope: self.scope.clone(),
            requested_risk: Some(self.risk),
        }
    }
}

/// An ordered set of intended steps awaiting or holding authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPlan {
    pub plan_id: Uuid,
    pub episode_id: String,
    pub subject: String,
    pub summary: String,
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
    /// The plan this one replaced, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
}

impl ToolPlan {
    /// Canonical SHA-256 of the plan.
    pub fn hash(&self) -> Result<PlanHash, PolicyError> {
        Ok(PlanHash(canonical_hash(self)?))
    }
}

/// Lowercase hex SHA-256 over a plan's canonical JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanHash(String);

impl PlanHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PlanHash {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

impl fmt::Display for PlanHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a plan is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStatus {
    Live(ToolPlan),
    Superseded { by: Uuid },
    Expired(ToolPlan),
    Unknown,
}

#[derive(Debug)]
struct PlanEntry {
    plan: ToolPlan,
    superseded_by: Option<Uuid>,
}

/// Creates, stores, and retires plans.
pub struct PlanManager {
    ledger: Arc<ReceiptLedger>,
    ttl: Option<Duration>,
    plans: Mutex<HashMap<Uuid, PlanEntry>>,
}

impl PlanManager {
    pub fn new(ledger: Arc<ReceiptLedger>) -> Self {
        Self {
            ledger,
            ttl: None,
            plans: Mutex::new(HashMap::new()),
        }
    }

    /// Plans older than `ttl` stop authorizing anything.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Validate, record, and store a new plan.
    pub fn create_plan(
        &self,
        steps: Vec<PlanStep>,
        subject: &str,
        episode_id: &str,
        summary: &str,
    ) -> Result<ToolPlan, PolicyError> {
        validate_steps(&steps)?;

        let plan = ToolPlan {
            plan_id: Uuid::new_v4(),
            episode_id: episode_id.to_string(),
            subject: subject.to_string(),
            summary: summary.to_string(),
            steps,
            created_at: Utc::now(),
            supersedes: None,
        };
        self.record_and_store(plan)
    }

    /// Canonical hash of any plan.
    pub fn hash(&self, plan: &ToolPlan) -> Result<PlanHash, PolicyError> {
        plan.hash()
    }

    /// A live plan, or `None` if it is unknown, superseded, or expired.
    pub fn get(&self, plan_id: Uuid) -> Result<Option<ToolPlan>, PolicyError> {
        Ok(match self.status(plan_id)? {
            PlanStatus::Live(plan) => Some(plan),
            _ => None,
        })
    }

    pub fn status(&self, plan_id: Uuid) -> Result<PlanStatus, PolicyError> {
        let plans = self.plans.lock().map_err(|_| PolicyError::LockPoisoned)?;
        let entry = match plans.get(&plan_id) {
            Some(entry) => entry,
            None => return Ok(PlanStatus::Unknown),
        };
        if let Some(by) = entry.superseded_by {
            return Ok(PlanStatus::Superseded { by });
        }
        if let Some(ttl) = self.ttl {
            if Utc::now() > entry.plan.created_at + ttl {
                return Ok(PlanStatus::Expired(entry.plan.clone()));
            }
        }
        Ok(PlanStatus::Live(entry.plan.clone()))
    }

    /// Replace a live plan's steps. The result is a new plan with a new id;
    /// the old plan stops authorizing anything.
    pub fn supersede(&self, plan_id: Uuid, steps: Vec<PlanStep>) -> Result<ToolPlan, PolicyError> {
        validate_steps(&steps)?;
        let old = self.get(plan_id)?.ok_or_else(|| PolicyError::PlanNotFound {
            plan_id: plan_id.to_string(),
        })?;

        let plan = ToolPlan {
            plan_id: Uuid::new_v4(),
            episode_id: old.episode_id,
            subject: old.subject,
            summary: old.summary,
            steps,
            created_at: Utc::now(),
            supersedes: Some(plan_id),
        };
        self.record_and_store(plan)
    }

    /// Hash of a recorded plan in any state, or `None` if it was never
    /// recorded.
    pub fn recorded_hash(&self, plan_id: Uuid) -> Result<Option<PlanHash>, PolicyError> {
        let plans = self.plans.lock().map_err(|_| PolicyError::LockPoisoned)?;
        plans.get(&plan_id).map(|entry| entry.plan.hash()).transpose()
    }

    /// Rebuild plan state from ToolPlan receipts, in append order. Returns
    /// the number of plans restored.
    pub fn restore(&self, receipts: &[Receipt]) -> Result<usize, PolicyError> {
        let mut plans = self.plans.lock().map_err(|_| PolicyError::LockPoisoned)?;
        let mut restored = 0;
        for receipt in receipts.iter().filter(|r| r.kind == ReceiptKind::ToolPlan) {
            let plan: ToolPlan = receipt.payload_as()?;
            store_entry(&mut plans, plan);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!(plans = restored, "plans restored from ledger");
        }
        Ok(restored)
    }

    fn record_and_store(&self, plan: ToolPlan) -> Result<ToolPlan, PolicyError> {
        // The plan exists once this receipt is durable, and not before.
        receipts::record(
            &self.ledger,
            &plan.episode_id,
            &plan,
            Temporal::observed_at(plan.created_at),
        )?;

        let mut plans = self.plans.lock().map_err(|_| PolicyError::LockPoisoned)?;
        store_entry(&mut plans, plan.clone());

        tracing::info!(
            plan_id = %plan.plan_id,
            episode_id = %plan.episode_id,
            steps = plan.steps.len(),
            supersedes = ?plan.supersedes,
            "plan recorded"
        );
        Ok(plan)
    }
}

fn store_entry(plans: &mut HashMap<Uuid, PlanEntry>, plan: ToolPlan) {
    if let Some(old_id) = plan.supersedes {
        if let Some(old) = plans.get_mut(&old_id) {
            old.superseded_by = Some(plan.plan_id);
        }
    }
    plans.insert(
        plan.plan_id,
        PlanEntry {
            plan,
            superseded_by: None,
        },
    );
}

fn validate_steps(steps: &[PlanStep]) -> Result<(), PolicyError> {
    if steps.is_empty() {
        return Err(PolicyError::InvalidPlan {
            reason: "a plan needs at least one step".to_string(),
        });
    }
    for (index, step) in steps.iter().enumerate() {
        if step.tool.trim().is_empty() {
            return Err(PolicyError::InvalidPlan {
                reason: format!("step {} has no tool", index),
            });
        }
        if step.scope.trim().is_empty() {
            return Err(PolicyError::InvalidPlan {
                reason: format!("step {} has no scope", index),
            });
        }
        if !step.risk.requires_authorization() {
            return Err(PolicyError::InvalidPlan {
                reason: format!(
                    "step {} is {}; only HIGH and CRITICAL steps are planned",
                    index, step.risk
                ),
            });
        }
    }
    Ok(())
}
