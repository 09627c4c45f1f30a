//! # csp-policy
//!
//! Enforcement logic for the CSP gateway: everything that decides whether a
//! side-effecting tool action may run.
//!
//! - [`RiskClassifier`] / [`PatternMatcher`]: LOW..CRITICAL classification
//!   with a default-deny pattern floor.
//! - [`PlanManager`]: immutable, canonically hashed tool plans, recorded
//!   before they exist.
//! - [`GuardianBinding`]: binds an external Guardian's verdict to one exact
//!   plan hash.
//! - [`ScopeEnforcer`]: execution-time tool/scope/risk re-checks.
//! - [`CapabilityTokenValidator`]: PCCap tokens with single-use replay
//!   protection.
//! - [`LawChangeValidator`]: the five-receipt episode that gates changes to
//!   the default-deny set.
//!
//! ## Key invariants
//!
//! - **Pattern floor**: a matched default pattern is always CRITICAL.
//! - **Exact binding**: a verdict authorizes only the plan hash it names.
//! - **Boundary containment**: `/tmp/scratchy` is not inside `/tmp/scratch`.
//! - **Single use**: a single-use token is granted at most once.

pub mod capability;
pub mod classifier;
pub mod error;
pub mod guardian;
pub mod lawchange;
pub mod pattern;
pub mod plan;
pub mod receipts;
pub mod risk;
pub mod scope;

pub use capability::{
    CapabilityDenial, CapabilityGrant, CapabilityIssuer, CapabilityTokenValidator, DenyReason,
    FileReplayStore, MemoryReplayStore, PcCapToken, ReplayStore, TokenRequest,
};
pub use classifier::{Classification, RiskClassifier, RiskHeuristic, RiskHint, ToolRiskTable};
pub use error::PolicyError;
pub use guardian::{
    AuthorizationOutcome, BindingRefusal, EscalationResolver, Guardian, GuardianBinding,
    GuardianError, GuardianVerdict, Verdict,
};
pub use lawchange::{
    CouncilDecisionPayload, Environment, InvariantViolationPayload, LawChangeAdmission,
    LawChangeError, LawChangeValidator, RuleChange, SandboxRunPayload, SelfRepairOutcomePayload,
    SelfRepairProposalPayload,
};
pub use pattern::{PatternMatch, PatternMatcher, PatternSpec};
pub use plan::{PlanHash, PlanManager, PlanStatus, PlanStep, ToolPlan};
pub use receipts::{
    AgentActionPayload, DecisionPath, EmergencyOverridePayload, GuardianVerdictPayload,
    ReceiptPayload, RefusalCode, RefusalPayload,
};
pub use risk::{RiskLevel, ToolAction};
pub use scope::{scope_contains, ScopeCheck, ScopeEnforcer, ScopeViolation, SymlinkPolicy};
