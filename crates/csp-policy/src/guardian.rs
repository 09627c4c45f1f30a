// guardian.rs — Binding Guardian verdicts to plan hashes.
//
// The Guardian is an opaque decision source. The binding is what the core
// owns: a verdict authorizes exactly the plan whose canonical hash it names,
// and nothing else. The flow for one plan is:
//
// 1. Mark the plan Pending (a second concurrent `authorize` is refused with
//    `authorization_pending` instead of consulting the Guardian again).
// 2. Hash the plan and call the Guardian on a worker thread, bounded by a
//    timeout. No answer in time is treated as no verdict. A timed-out call
//    stays attached to its plan, and the next attempt waits on it instead of
//    starting another worker.
// 3. Record the verdict as a GuardianVerdict receipt.
// 4. Reject verdicts that name a different hash. Resolve ESCALATE through
//    the EscalationResolver when one is configured.
// 5. Bind (plan_id, plan_hash, verdict).
//
// ALLOW and DENY bindings never change again. An ESCALATE binding stays open
// until a resolution to ALLOW or DENY for the same hash is recorded, either
// from the resolver on a later `authorize` or through `resolve_escalation`.
// Bindings are rebuilt from GuardianVerdict receipts by `restore`.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use csp_ledger::{Receipt, ReceiptKind, ReceiptLedger, Temporal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::PolicyError;
use crate::plan::{PlanHash, PlanManager, ToolPlan};
use crate::receipts::{self, GuardianVerdictPayload, RefusalCode};

/// A Guardian decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,
    Escalate,
    Deny,
}

/// A verdict on one exact plan hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianVerdict {
    pub plan_hash: PlanHash,
    pub verdict: Verdict,
    pub rationale: String,
}

/// Failure to obtain a verdict. All variants mean "no verdict".
#[derive(Debug, Error)]
pub enum GuardianError {
    #[error("guardian did not answer within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("guardian unavailable: {reason}")]
    Unavailable { reason: String },
}

/// External authorization decision point.
pub trait Guardian: Send + Sync {
    fn evaluate(
        &self,
        plan: &ToolPlan,
        plan_hash: &PlanHash,
    ) -> Result<GuardianVerdict, GuardianError>;
}

/// Resolves an ESCALATE verdict to ALLOW or DENY (e.g. a human reviewer).
pub trait EscalationResolver: Send + Sync {
    fn resolve(
        &self,
        plan: &ToolPlan,
        escalated: &GuardianVerdict,
    ) -> Result<GuardianVerdict, GuardianError>;
}

/// Why a plan is not (or not yet) authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRefusal {
    pub code: RefusalCode,
    pub detail: String,
}

/// Result of an `authorize` call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum AuthorizationOutcome {
    /// A verdict is bound to the plan. It may still be DENY or ESCALATE.
    Bound(GuardianVerdict),
    /// No verdict could be bound.
    Refused(BindingRefusal),
}

#[derive(Debug, Clone)]
enum Binding {
    Pending,
    Bound(GuardianVerdict),
}

/// Obtains verdicts and binds them to plan hashes.
pub struct GuardianBinding {
    guardian: Arc<dyn Guardian>,
    resolver: Option<Arc<dyn EscalationResolver>>,
    ledger: Arc<ReceiptLedger>,
    timeout: Duration,
    bindings: Mutex<HashMap<Uuid, Binding>>,
    stalled: Mutex<HashMap<Uuid, GuardianReply>>,
}

type GuardianReply = mpsc::Receiver<Result<GuardianVerdict, GuardianError>>;

impl GuardianBinding {
    pub fn new(guardian: Arc<dyn Guardian>, ledger: Arc<ReceiptLedger>, timeout: Duration) -> Self {
        Self {
            guardian,
            resolver: None,
            ledger,
            timeout,
            bindings: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn EscalationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Obtain and bind a verdict for `plan`.
    pub fn authorize(&self, plan: &ToolPlan) -> Result<AuthorizationOutcome, PolicyError> {
        {
            let mut bindings = self.bindings.lock().map_err(|_| PolicyError::LockPoisoned)?;
            match bindings.get(&plan.plan_id) {
                Some(Binding::Pending) => {
                    return Ok(AuthorizationOutcome::Refused(BindingRefusal {
                        code: RefusalCode::AuthorizationPending,
                        detail: format!("plan {} is already being authorized", plan.plan_id),
                    }));
                }
                Some(Binding::Bound(verdict))
                    if verdict.verdict == Verdict::Escalate && self.resolver.is_some() =>
                {
                    let escalated = verdict.clone();
                    bindings.insert(plan.plan_id, Binding::Pending);
                    drop(bindings);
                    return self.retry_escalation(plan, escalated);
                }
                Some(Binding::Bound(verdict)) => {
                    return Ok(AuthorizationOutcome::Bound(verdict.clone()));
                }
                None => {
                    bindings.insert(plan.plan_id, Binding::Pending);
                }
            }
        }

        let result = self.obtain_verdict(plan);

        let mut bindings = self.bindings.lock().map_err(|_| PolicyError::LockPoisoned)?;
        match result {
            Ok(AuthorizationOutcome::Bound(verdict)) => {
                bindings.insert(plan.plan_id, Binding::Bound(verdict.clone()));
                tracing::info!(
                    plan_id = %plan.plan_id,
                    plan_hash = %verdict.plan_hash,
                    verdict = ?verdict.verdict,
                    "verdict bound to plan"
                );
                Ok(AuthorizationOutcome::Bound(verdict))
            }
            other => {
                // Nothing bound: a later attempt may consult the Guardian again.
                bindings.remove(&plan.plan_id);
                other
            }
        }
    }

    fn obtain_verdict(&self, plan: &ToolPlan) -> Result<AuthorizationOutcome, PolicyError> {
        let plan_hash = plan.hash()?;

        let verdict = match self.call_guardian(plan, &plan_hash) {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(plan_id = %plan.plan_id, error = %e, "no verdict from guardian");
                return Ok(AuthorizationOutcome::Refused(BindingRefusal {
                    code: RefusalCode::NoVerdict,
                    detail: e.to_string(),
                }));
            }
        };
        self.record(plan, &verdict, false)?;

        if verdict.plan_hash != plan_hash {
            tracing::warn!(
                plan_id = %plan.plan_id,
                expected = %plan_hash,
                got = %verdict.plan_hash,
                "guardian verdict names a different plan hash"
            );
            return Ok(AuthorizationOutcome::Refused(BindingRefusal {
                code: RefusalCode::PlanHashMismatch,
                detail: format!(
                    "verdict is bound to {} but the plan hashes to {}",
                    verdict.plan_hash, plan_hash
                ),
            }));
        }

        if verdict.verdict != Verdict::Escalate {
            return Ok(AuthorizationOutcome::Bound(verdict));
        }

        match &self.resolver {
            Some(resolver) => self.consult_resolver(resolver.as_ref(), plan, verdict),
            None => Ok(AuthorizationOutcome::Bound(verdict)),
        }
    }

    /// Ask the resolver again about a plan left escalated by an earlier call.
    /// The plan is Pending while the resolver runs.
    fn retry_escalation(
        &self,
        plan: &ToolPlan,
        escalated: GuardianVerdict,
    ) -> Result<AuthorizationOutcome, PolicyError> {
        let result = match &self.resolver {
            Some(resolver) => self.consult_resolver(resolver.as_ref(), plan, escalated.clone()),
            None => Ok(AuthorizationOutcome::Bound(escalated.clone())),
        };

        let mut bindings = self.bindings.lock().map_err(|_| PolicyError::LockPoisoned)?;
        let bound = match &result {
            Ok(AuthorizationOutcome::Bound(verdict)) => verdict.clone(),
            _ => escalated,
        };
        bindings.insert(plan.plan_id, Binding::Bound(bound));
        result
    }

    fn consult_resolver(
        &self,
        resolver: &dyn EscalationResolver,
        plan: &ToolPlan,
        escalated: GuardianVerdict,
    ) -> Result<AuthorizationOutcome, PolicyError> {
        match resolver.resolve(plan, &escalated) {
            Ok(resolved)
                if resolved.plan_hash == escalated.plan_hash
                    && resolved.verdict != Verdict::Escalate =>
            {
                self.record(plan, &resolved, true)?;
                Ok(AuthorizationOutcome::Bound(resolved))
            }
            Ok(resolved) => {
                tracing::warn!(
                    plan_id = %plan.plan_id,
                    verdict = ?resolved.verdict,
                    "escalation resolution rejected; plan stays escalated"
                );
                Ok(AuthorizationOutcome::Bound(escalated))
            }
            Err(e) => {
                tracing::warn!(plan_id = %plan.plan_id, error = %e, "escalation unresolved");
                Ok(AuthorizationOutcome::Bound(escalated))
            }
        }
    }

    /// Resolve an escalated plan with a decision made outside the resolver,
    /// such as an operator's review. The resolution must name the escalated
    /// hash and be ALLOW or DENY; it is recorded before it is bound.
    pub fn resolve_escalation(
        &self,
        plan: &ToolPlan,
        resolution: GuardianVerdict,
    ) -> Result<AuthorizationOutcome, PolicyError> {
        let mut bindings = self.bindings.lock().map_err(|_| PolicyError::LockPoisoned)?;
        let escalated = match bindings.get(&plan.plan_id) {
            Some(Binding::Bound(verdict)) if verdict.verdict == Verdict::Escalate => {
                verdict.clone()
            }
            Some(Binding::Pending) => {
                return Ok(AuthorizationOutcome::Refused(BindingRefusal {
                    code: RefusalCode::AuthorizationPending,
                    detail: format!("plan {} is already being authorized", plan.plan_id),
                }));
            }
            _ => {
                return Err(PolicyError::NotEscalated {
                    plan_id: plan.plan_id.to_string(),
                })
            }
        };

        if resolution.plan_hash != escalated.plan_hash {
            return Ok(AuthorizationOutcome::Refused(BindingRefusal {
                code: RefusalCode::PlanHashMismatch,
                detail: format!(
                    "resolution names {} but the escalated verdict is bound to {}",
                    resolution.plan_hash, escalated.plan_hash
                ),
            }));
        }
        if resolution.verdict == Verdict::Escalate {
            return Ok(AuthorizationOutcome::Refused(BindingRefusal {
                code: RefusalCode::VerdictEscalated,
                detail: "an escalation must be resolved to ALLOW or DENY".to_string(),
            }));
        }

        self.record(plan, &resolution, true)?;
        bindings.insert(plan.plan_id, Binding::Bound(resolution.clone()));
        tracing::info!(
            plan_id = %plan.plan_id,
            verdict = ?resolution.verdict,
            "escalation resolved"
        );
        Ok(AuthorizationOutcome::Bound(resolution))
    }

    /// Rebuild bindings from GuardianVerdict receipts, in append order.
    /// Verdicts naming a hash other than the recorded plan's are skipped,
    /// as they were never bound. Returns the number of plans bound.
    pub fn restore(&self, receipts: &[Receipt], plans: &PlanManager) -> Result<usize, PolicyError> {
        let mut bindings = self.bindings.lock().map_err(|_| PolicyError::LockPoisoned)?;
        for receipt in receipts
            .iter()
            .filter(|r| r.kind == ReceiptKind::GuardianVerdict)
        {
            let recorded: GuardianVerdictPayload = receipt.payload_as()?;
            if plans.recorded_hash(recorded.plan_id)?.as_ref() != Some(&recorded.plan_hash) {
                continue;
            }
            let reopens = match bindings.get(&recorded.plan_id) {
                None => true,
                Some(Binding::Bound(current)) => {
                    current.verdict == Verdict::Escalate
                        && recorded.escalation_resolution
                        && recorded.verdict != Verdict::Escalate
                }
                Some(Binding::Pending) => false,
            };
            if reopens {
                bindings.insert(
                    recorded.plan_id,
                    Binding::Bound(GuardianVerdict {
                        plan_hash: recorded.plan_hash,
                        verdict: recorded.verdict,
                        rationale: recorded.rationale,
                    }),
                );
            }
        }
        if !bindings.is_empty() {
            tracing::info!(bindings = bindings.len(), "verdict bindings restored from ledger");
        }
        Ok(bindings.len())
    }

    fn call_guardian(
        &self,
        plan: &ToolPlan,
        plan_hash: &PlanHash,
    ) -> Result<GuardianVerdict, GuardianError> {
        let state_lost = || GuardianError::Unavailable {
            reason: "guardian call state lock poisoned".to_string(),
        };

        let earlier = self.stalled.lock().map_err(|_| state_lost())?.remove(&plan.plan_id);
        let rx = match earlier {
            Some(rx) => {
                tracing::debug!(plan_id = %plan.plan_id, "waiting on earlier guardian call");
                rx
            }
            None => {
                let (tx, rx) = mpsc::channel();
                let guardian = Arc::clone(&self.guardian);
                let plan = plan.clone();
                let plan_hash = plan_hash.clone();
                std::thread::spawn(move || {
                    // The receiver is gone if the binding itself was dropped.
                    let _ = tx.send(guardian.evaluate(&plan, &plan_hash));
                });
                rx
            }
        };

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.stalled
                    .lock()
                    .map_err(|_| state_lost())?
                    .insert(plan.plan_id, rx);
                Err(GuardianError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(GuardianError::Unavailable {
                reason: "guardian worker exited without a verdict".to_string(),
            }),
        }
    }

    fn record(
        &self,
        plan: &ToolPlan,
        verdict: &GuardianVerdict,
        escalation_resolution: bool,
    ) -> Result<(), PolicyError> {
        let payload = GuardianVerdictPayload {
            plan_id: plan.plan_id,
            plan_hash: verdict.plan_hash.clone(),
            verdict: verdict.verdict,
            rationale: verdict.rationale.clone(),
            escalation_resolution,
        };
        receipts::record(&self.ledger, &plan.episode_id, &payload, Temporal::observed_now())?;
        Ok(())
    }

    /// Whether `plan` (hashing to `plan_hash`) may execute now.
    pub fn check(
        &self,
        plan_id: Uuid,
        plan_hash: &PlanHash,
    ) -> Result<GuardianVerdict, BindingRefusal> {
        let bindings = self.bindings.lock().map_err(|_| BindingRefusal {
            code: RefusalCode::NoVerdict,
            detail: "binding state unavailable".to_string(),
        })?;
        let verdict = match bindings.get(&plan_id) {
            None => {
                return Err(BindingRefusal {
                    code: RefusalCode::NoVerdict,
                    detail: format!("no verdict is bound to plan {}", plan_id),
                })
            }
            Some(Binding::Pending) => {
                return Err(BindingRefusal {
                    code: RefusalCode::AuthorizationPending,
                    detail: format!("plan {} is still awaiting a verdict", plan_id),
                })
            }
            Some(Binding::Bound(verdict)) => verdict,
        };

        if &verdict.plan_hash != plan_hash {
            return Err(BindingRefusal {
                code: RefusalCode::PlanHashMismatch,
                detail: format!(
                    "verdict is bound to {} but the plan hashes to {}",
                    verdict.plan_hash, plan_hash
                ),
            });
        }
        match verdict.verdict {
            Verdict::Allow => Ok(verdict.clone()),
            Verdict::Deny => Err(BindingRefusal {
                code: RefusalCode::VerdictDeny,
                detail: verdict.rationale.clone(),
            }),
            Verdict::Escalate => Err(BindingRefusal {
                code: RefusalCode::VerdictEscalated,
                detail: "the plan was escalated and the escalation is unresolved".to_string(),
            }),
        }
    }
}
