//! # csp-gateway
//!
//! The Gatekeeper: the single place where an agent's side-effecting tool
//! actions are classified, checked against plans, verdicts, and capability
//! tokens, and recorded as hash-chained receipts.
//!
//! ```text
//! agent ──ActionRequest──► Gatekeeper::evaluate
//!                            ├─ RiskClassifier      (LOW..CRITICAL, pattern floor)
//!                            ├─ PlanManager         (live plan, canonical hash)
//!                            ├─ GuardianBinding     (ALLOW bound to that hash)
//!                            ├─ ScopeEnforcer       (tool, scope, risk ceiling)
//!                            ├─ CapabilityTokenValidator (PCCap, single use)
//!                            └─ ReceiptLedger       (AgentAction / Refusal)
//! ```
//!
//! A decision is only returned once its receipt is durable. Configuration
//! lives in `.csp/gateway.toml` (see [`GatewayConfig`]).

pub mod config;
pub mod error;
pub mod gateway;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{
    ActionRequest, Authorization, Decision, ExecutionPermit, Gatekeeper, GatekeeperBuilder,
    Refusal,
};
