// gateway.rs — The Gatekeeper: classify, plan, authorize, execute, record.
//
// Every decision reaches the ledger before it reaches the caller. A permit is
// an AgentAction receipt with `executed: false`; a refusal is a Refusal
// receipt with a reason code, a neutral citation, and a safer alternative.
// When the ledger cannot record, the call fails with `GatewayError::Ledger`
// and nothing is permitted.
//
// Which actions need authorization depends on the tier: CRITICAL always,
// HIGH from Standard upward. Authorization is either a live plan whose bound
// Guardian verdict is ALLOW for its exact hash, or a PCCap token.

use std::sync::{Arc, Mutex, RwLock};

use csp_ledger::{
    AnchorService, ChainReport, ConformanceTier, JsonlReceiptStore, Receipt, ReceiptKind,
    ReceiptLedger, ReceiptStore, Signer, Temporal, Verifier,
};
use csp_policy::receipts::{self, ReceiptPayload};
use csp_policy::{
    AgentActionPayload, AuthorizationOutcome, BindingRefusal, CapabilityTokenValidator,
    Classification, DecisionPath, EmergencyOverridePayload, EscalationResolver, FileReplayStore,
    Guardian, GuardianBinding, GuardianVerdict, LawChangeAdmission, LawChangeValidator,
    PcCapToken, PlanManager, PlanStatus, PlanStep, RefusalCode, RefusalPayload, ReplayStore,
    RiskClassifier, RiskHeuristic, RiskLevel, ScopeEnforcer, ToolAction, ToolPlan,
    ToolRiskTable, Verdict,
};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// How the caller claims the right to run a HIGH or CRITICAL action.
#[derive(Debug, Clone, Default)]
pub enum Authorization {
    #[default]
    None,
    /// Step `step_index` of an authorized plan.
    Plan { plan_id: Uuid, step_index: usize },
    Token(PcCapToken),
}

/// One proposed tool action, as submitted by an agent.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub episode_id: String,
    pub principal: String,
    pub action: ToolAction,
    pub authorization: Authorization,
}

impl ActionRequest {
    pub fn new(
        episode_id: impl Into<String>,
        principal: impl Into<String>,
        action: ToolAction,
    ) -> Self {
        Self {
            episode_id: episode_id.into(),
            principal: principal.into(),
            action,
            authorization: Authorization::None,
        }
    }

    pub fn under_plan(mut self, plan_id: Uuid, step_index: usize) -> Self {
        self.authorization = Authorization::Plan {
            plan_id,
            step_index,
        };
        self
    }

    pub fn with_token(mut self, token: PcCapToken) -> Self {
        self.authorization = Authorization::Token(token);
        self
    }
}

/// Permission to run one action. Consumed by [`Gatekeeper::record_outcome`].
/// Dropping it unused leaves the permit receipt as the only trace.
#[derive(Debug)]
#[must_use = "a permit should be passed to record_outcome once the action has run"]
pub struct ExecutionPermit {
    permit_id: Uuid,
    episode_id: String,
    action: ToolAction,
    classification: Classification,
    decision_path: DecisionPath,
    receipt: Receipt,
}

impl ExecutionPermit {
    pub fn permit_id(&self) -> Uuid {
        self.permit_id
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn action(&self) -> &ToolAction {
        &self.action
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn decision_path(&self) -> &DecisionPath {
        &self.decision_path
    }

    /// The AgentAction receipt (`executed: false`) written for this permit.
    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }
}

/// A refused action and the receipt that records it.
#[derive(Debug, Clone)]
pub struct Refusal {
    pub code: RefusalCode,
    pub citation: String,
    pub safer_alternative: Option<String>,
    pub classification: Classification,
    pub receipt: Receipt,
}

/// Outcome of [`Gatekeeper::evaluate`].
#[derive(Debug)]
pub enum Decision {
    Permitted(ExecutionPermit),
    Refused(Refusal),
}

impl Decision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Decision::Permitted(_))
    }

    pub fn refusal(&self) -> Option<&Refusal> {
        match self {
            Decision::Refused(refusal) => Some(refusal),
            Decision::Permitted(_) => None,
        }
    }

    pub fn into_permit(self) -> Option<ExecutionPermit> {
        match self {
            Decision::Permitted(permit) => Some(permit),
            Decision::Refused(_) => None,
        }
    }
}

/// Assembles a [`Gatekeeper`] from configuration and injected capabilities.
pub struct GatekeeperBuilder {
    config: GatewayConfig,
    guardian: Arc<dyn Guardian>,
    store: Option<Arc<dyn ReceiptStore>>,
    signer: Option<Arc<dyn Signer>>,
    verifier: Option<Arc<dyn Verifier>>,
    replay: Option<Arc<dyn ReplayStore>>,
    resolver: Option<Arc<dyn EscalationResolver>>,
    heuristics: Vec<Box<dyn RiskHeuristic>>,
}

impl GatekeeperBuilder {
    pub fn new(config: GatewayConfig, guardian: Arc<dyn Guardian>) -> Self {
        Self {
            config,
            guardian,
            store: None,
            signer: None,
            verifier: None,
            replay: None,
            resolver: None,
            heuristics: Vec::new(),
        }
    }

    /// Use this store instead of the JSONL file at `ledger_path`.
    pub fn store(mut self, store: Arc<dyn ReceiptStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Verifies receipt signatures, law-change episodes, and PCCap tokens.
    /// Without one, tokens are never accepted.
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Use this replay store instead of the log at `replay_log_path`.
    pub fn replay_store(mut self, replay: Arc<dyn ReplayStore>) -> Self {
        self.replay = Some(replay);
        self
    }

    pub fn escalation_resolver(mut self, resolver: Arc<dyn EscalationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn heuristic(mut self, heuristic: Box<dyn RiskHeuristic>) -> Self {
        self.heuristics.push(heuristic);
        self
    }

    pub fn build(self) -> Result<Gatekeeper, GatewayError> {
        let config = self.config;

        if let Some(expected) = &config.signing_key_id {
            let actual = self.signer.as_ref().map(|s| s.key_id().to_string());
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(GatewayError::Config {
                    path: config.ledger_path.clone(),
                    reason: match actual {
                        Some(actual) => format!(
                            "signer holds key '{}' but signing_key_id is '{}'",
                            actual, expected
                        ),
                        None => format!(
                            "signing_key_id '{}' is set but no signer was provided",
                            expected
                        ),
                    },
                });
            }
        }

        let store: Arc<dyn ReceiptStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonlReceiptStore::open(&config.ledger_path)?),
        };
        let ledger = Arc::new(ReceiptLedger::open(store, config.tier, self.signer)?);

        let mut classifier = RiskClassifier::with_defaults()?;
        for spec in &config.extra_patterns {
            classifier.register_pattern(spec.clone())?;
        }
        if !config.tool_risk.is_empty() {
            classifier.add_heuristic(Box::new(ToolRiskTable::from(config.tool_risk.clone())));
        }
        for heuristic in self.heuristics {
            classifier.add_heuristic(heuristic);
        }

        let mut plans = PlanManager::new(Arc::clone(&ledger));
        if let Some(ttl) = config.plan_ttl() {
            plans = plans.with_ttl(ttl);
        }

        let mut binding = GuardianBinding::new(
            self.guardian,
            Arc::clone(&ledger),
            config.guardian_timeout(),
        );
        if let Some(resolver) = self.resolver {
            binding = binding.with_resolver(resolver);
        }

        // Plans and verdicts recorded before a restart still count.
        let history = ledger.receipts()?;
        plans.restore(&history)?;
        binding.restore(&history, &plans)?;

        let tokens = match &self.verifier {
            Some(verifier) => {
                let replay: Arc<dyn ReplayStore> = match self.replay {
                    Some(replay) => replay,
                    None => Arc::new(FileReplayStore::open(&config.replay_log_path)?),
                };
                Some(CapabilityTokenValidator::new(
                    Arc::clone(verifier),
                    replay,
                    ScopeEnforcer::new(config.symlink_policy),
                ))
            }
            None => None,
        };

        let law = LawChangeValidator::new(config.tier, self.verifier.clone());

        tracing::info!(
            tier = %config.tier,
            environment = ?config.environment,
            extra_patterns = config.extra_patterns.len(),
            tokens_enabled = tokens.is_some(),
            "gatekeeper ready"
        );

        Ok(Gatekeeper {
            scopes: ScopeEnforcer::new(config.symlink_policy),
            config,
            ledger,
            classifier: RwLock::new(classifier),
            plans,
            binding,
            tokens,
            verifier: self.verifier,
            law,
            overrides: Mutex::new(()),
        })
    }
}

/// The policy enforcement point for side-effecting tool actions.
pub struct Gatekeeper {
    config: GatewayConfig,
    ledger: Arc<ReceiptLedger>,
    classifier: RwLock<RiskClassifier>,
    plans: PlanManager,
    binding: GuardianBinding,
    scopes: ScopeEnforcer,
    tokens: Option<CapabilityTokenValidator>,
    verifier: Option<Arc<dyn Verifier>>,
    law: LawChangeValidator,
    /// Held from the already-overridden check until the override is recorded.
    overrides: Mutex<()>,
}

impl Gatekeeper {
    pub fn builder(config: GatewayConfig, guardian: Arc<dyn Guardian>) -> GatekeeperBuilder {
        GatekeeperBuilder::new(config, guardian)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn tier(&self) -> ConformanceTier {
        self.config.tier
    }

    pub fn ledger(&self) -> &Arc<ReceiptLedger> {
        &self.ledger
    }

    /// Classify without recording anything.
    pub fn classify(&self, action: &ToolAction) -> Result<Classification, GatewayError> {
        let classifier = self.classifier.read().map_err(|_| GatewayError::LockPoisoned)?;
        Ok(classifier.classify(action))
    }

    /// Record a new plan. It exists once its ToolPlan receipt is durable.
    pub fn submit_plan(
        &self,
        episode_id: &str,
        subject: &str,
        summary: &str,
        steps: Vec<PlanStep>,
    ) -> Result<ToolPlan, GatewayError> {
        Ok(self.plans.create_plan(steps, subject, episode_id, summary)?)
    }

    /// Replace a live plan's steps. The new plan needs its own authorization.
    pub fn supersede_plan(
        &self,
        plan_id: Uuid,
        steps: Vec<PlanStep>,
    ) -> Result<ToolPlan, GatewayError> {
        Ok(self.plans.supersede(plan_id, steps)?)
    }

    /// Ask the Guardian for a verdict on a live plan and bind it. When no
    /// verdict can be bound, a Refusal receipt citing the plan's first step
    /// is written before returning.
    pub fn authorize_plan(&self, plan_id: Uuid) -> Result<AuthorizationOutcome, GatewayError> {
        let plan = self
            .plans
            .get(plan_id)?
            .ok_or_else(|| csp_policy::PolicyError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })?;

        let outcome = self.binding.authorize(&plan)?;
        if let AuthorizationOutcome::Refused(refusal) = &outcome {
            if let Some(step) = plan.steps.first() {
                let action = step.to_action();
                let classification = self.classify(&action)?;
                self.refuse(
                    &plan.episode_id,
                    &action,
                    classification,
                    refusal.code,
                    format!("plan {} was not authorized: {}", plan.plan_id, refusal.detail),
                )?;
            }
        }
        Ok(outcome)
    }

    /// Resolve an escalated plan with a reviewer's ALLOW or DENY. The
    /// resolution is recorded as a GuardianVerdict receipt before it binds.
    pub fn resolve_escalation(
        &self,
        plan_id: Uuid,
        verdict: Verdict,
        rationale: &str,
    ) -> Result<AuthorizationOutcome, GatewayError> {
        let plan = self
            .plans
            .get(plan_id)?
            .ok_or_else(|| csp_policy::PolicyError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })?;
        let resolution = GuardianVerdict {
            plan_hash: plan.hash()?,
            verdict,
            rationale: rationale.to_string(),
        };
        Ok(self.binding.resolve_escalation(&plan, resolution)?)
    }

    /// Decide whether an action may run. The decision is recorded before it
    /// is returned.
    pub fn evaluate(&self, request: ActionRequest) -> Result<Decision, GatewayError> {
        let classification = self.classify(&request.action)?;
        let level = classification.level;
        tracing::debug!(
            episode_id = %request.episode_id,
            tool = %request.action.tool,
            %level,
            matched = ?classification.matched_ids(),
            "action classified"
        );

        if !self.requires_authorization(level) {
            let permit = self.permit(
                &request.episode_id,
                request.action,
                classification,
                DecisionPath::Unplanned,
            )?;
            return Ok(Decision::Permitted(permit));
        }

        match &request.authorization {
            Authorization::None => {
                let citation = format!(
                    "{} actions require an authorized plan or a capability token at the {} tier",
                    level,
                    self.config.tier
                );
                self.refuse_decision(&request, classification, RefusalCode::NoPlan, citation)
            }
            Authorization::Plan {
                plan_id,
                step_index,
            } => self.evaluate_under_plan(&request, classification, *plan_id, *step_index),
            Authorization::Token(token) => {
                self.evaluate_with_token(&request, classification, token)
            }
        }
    }

    fn evaluate_under_plan(
        &self,
        request: &ActionRequest,
        classification: Classification,
        plan_id: Uuid,
        step_index: usize,
    ) -> Result<Decision, GatewayError> {
        let plan = match self.plans.status(plan_id)? {
            PlanStatus::Live(plan) => plan,
            PlanStatus::Expired(_) => {
                let citation =
                    format!("plan {} has expired and no longer authorizes actions", plan_id);
                let code = RefusalCode::PlanExpired;
                return self.refuse_decision(request, classification, code, citation);
            }
            PlanStatus::Superseded { by } => {
                let citation = format!("plan {} was superseded by plan {}", plan_id, by);
                return self.refuse_decision(request, classification, RefusalCode::NoPlan, citation);
            }
            PlanStatus::Unknown => {
                let citation = format!("no plan with id {} exists", plan_id);
                return self.refuse_decision(request, classification, RefusalCode::NoPlan, citation);
            }
        };

        if plan.episode_id != request.episode_id {
            let citation = format!(
                "plan {} belongs to episode {}, not {}",
                plan_id, plan.episode_id, request.episode_id
            );
            return self.refuse_decision(request, classification, RefusalCode::NoPlan, citation);
        }

        let plan_hash = plan.hash()?;
        if let Err(BindingRefusal { code, detail }) = self.binding.check(plan_id, &plan_hash) {
            return self.refuse_decision(request, classification, code, detail);
        }

        let step = match plan.steps.get(step_index) {
            Some(step) => step,
            None => {
                let citation = format!(
                    "plan {} has {} steps; step {} does not exist",
                    plan_id,
                    plan.steps.len(),
                    step_index
                );
                let code = RefusalCode::ScopeMismatch;
                return self.refuse_decision(request, classification, code, citation);
            }
        };

        if let Err(violation) = self.scopes.check(step, &request.action, classification.level) {
            return self.refuse_decision(
                request,
                classification,
                RefusalCode::ScopeMismatch,
                violation.to_string(),
            );
        }

        let permit = self.permit(
            &request.episode_id,
            request.action.clone(),
            classification,
            DecisionPath::Plan {
                plan_id,
                plan_hash,
                step_index,
            },
        )?;
        Ok(Decision::Permitted(permit))
    }

    fn evaluate_with_token(
        &self,
        request: &ActionRequest,
        classification: Classification,
        token: &PcCapToken,
    ) -> Result<Decision, GatewayError> {
        let validator = match &self.tokens {
            Some(validator) => validator,
            None => {
                let citation =
                    "capability tokens cannot be verified by this gateway".to_string();
                return self.refuse_decision(
                    request,
                    classification,
                    RefusalCode::TokenSignatureInvalid,
                    citation,
                );
            }
        };

        match validator.validate(token, &request.action, &request.principal) {
            Ok(grant) => {
                let permit = self.permit(
                    &request.episode_id,
                    request.action.clone(),
                    classification,
                    DecisionPath::Token {
                        token_id: grant.token_id,
                    },
                )?;
                Ok(Decision::Permitted(permit))
            }
            Err(denial) => {
                self.refuse_decision(request, classification, denial.reason.into(), denial.detail)
            }
        }
    }

    /// Revoke a capability token by id. Returns `false` if it was already
    /// revoked.
    pub fn revoke_token(&self, token_id: &str) -> Result<bool, GatewayError> {
        let validator = self.tokens.as_ref().ok_or(GatewayError::TokensDisabled)?;
        Ok(validator.revoke(token_id)?)
    }

    /// Record that a permitted action ran. Consumes the permit.
    pub fn record_outcome(
        &self,
        permit: ExecutionPermit,
        outcome: Option<serde_json::Value>,
    ) -> Result<Receipt, GatewayError> {
        let payload = AgentActionPayload {
            permit_id: permit.permit_id,
            action: permit.action,
            classification: permit.classification.level,
            matched_patterns: permit.classification.matched_ids(),
            decision_path: permit.decision_path,
            executed: true,
            outcome,
        };
        let receipt = receipts::record(
            &self.ledger,
            &permit.episode_id,
            &payload,
            Temporal::observed_now(),
        )?;
        tracing::info!(
            episode_id = %permit.episode_id,
            permit_id = %permit.permit_id,
            receipt = %receipt.hash,
            "action outcome recorded"
        );
        Ok(receipt)
    }

    /// Override a recorded refusal. The EmergencyOverride receipt is durable
    /// before the permit is issued, and each refusal can be overridden once.
    pub fn emergency_override(
        &self,
        episode_id: &str,
        refusal_hash: &str,
        justification: &str,
        operator: &str,
    ) -> Result<ExecutionPermit, GatewayError> {
        if justification.trim().is_empty() {
            return Err(GatewayError::InvalidOverride(
                "a justification is required".to_string(),
            ));
        }
        if operator.trim().is_empty() {
            return Err(GatewayError::InvalidOverride(
                "the overriding operator must be named".to_string(),
            ));
        }

        let guard = self.overrides.lock().map_err(|_| GatewayError::LockPoisoned)?;
        let receipts = self.ledger.episode(episode_id)?;
        let refused = receipts
            .iter()
            .find(|r| r.hash == refusal_hash)
            .ok_or_else(|| {
                GatewayError::InvalidOverride(format!(
                    "episode {} has no receipt with hash {}",
                    episode_id, refusal_hash
                ))
            })?;
        if refused.kind != ReceiptKind::Refusal {
            return Err(GatewayError::InvalidOverride(format!(
                "receipt {} is a {} receipt, not a refusal",
                refusal_hash, refused.kind
            )));
        }
        let already_overridden = receipts
            .iter()
            .filter(|r| r.kind == EmergencyOverridePayload::KIND)
            .filter_map(|r| r.payload_as::<EmergencyOverridePayload>().ok())
            .any(|o| o.action_ref == refusal_hash);
        if already_overridden {
            return Err(GatewayError::InvalidOverride(format!(
                "refusal {} has already been overridden",
                refusal_hash
            )));
        }

        let refusal: RefusalPayload = refused.payload_as()?;
        let payload = EmergencyOverridePayload {
            action_ref: refusal_hash.to_string(),
            action: refusal.action.clone(),
            justification: justification.to_string(),
            operator: operator.to_string(),
        };
        let override_receipt =
            receipts::record(&self.ledger, episode_id, &payload, Temporal::observed_now())?;
        drop(guard);

        tracing::warn!(
            episode_id = %episode_id,
            refusal = %refusal_hash,
            reason_code = %refusal.reason_code,
            %operator,
            "emergency override recorded"
        );

        let classification = self.classify(&refusal.action)?;
        self.permit(
            episode_id,
            refusal.action,
            classification,
            DecisionPath::EmergencyOverride {
                override_receipt: override_receipt.hash,
            },
        )
    }

    /// Anchor every receipt currently in an episode.
    pub fn anchor_episode(
        &self,
        episode_id: &str,
        service: &dyn AnchorService,
    ) -> Result<Receipt, GatewayError> {
        Ok(self
            .ledger
            .anchor(episode_id, service, Temporal::observed_now())?)
    }

    /// Verify an episode with this gateway's tier requirements and verifier.
    pub fn verify_episode(&self, episode_id: &str) -> Result<ChainReport, GatewayError> {
        Ok(self
            .ledger
            .verify_episode(episode_id, self.verifier.as_deref())?)
    }

    /// Validate the law-change episode recorded under `episode_id` and, if it
    /// is admitted, apply its rule change to the pattern set.
    pub fn apply_law_change(&self, episode_id: &str) -> Result<LawChangeAdmission, GatewayError> {
        let receipts = self.ledger.episode(episode_id)?;
        let admission = self.law.admit(&receipts, self.config.environment)?;
        if admission.is_provisional() {
            tracing::warn!(
                proposal_id = %admission.proposal_id(),
                warnings = ?admission.warnings(),
                "applying provisional law change"
            );
        }
        let mut classifier = self
            .classifier
            .write()
            .map_err(|_| GatewayError::LockPoisoned)?;
        classifier.apply_law_change(&admission)?;
        tracing::info!(
            proposal_id = %admission.proposal_id(),
            change = %admission.change(),
            "law change applied"
        );
        Ok(admission)
    }

    fn requires_authorization(&self, level: RiskLevel) -> bool {
        match level {
            RiskLevel::Critical => true,
            RiskLevel::High => self.config.tier.binds_high_risk(),
            RiskLevel::Low | RiskLevel::Medium => false,
        }
    }

    fn permit(
        &self,
        episode_id: &str,
        action: ToolAction,
        classification: Classification,
        decision_path: DecisionPath,
    ) -> Result<ExecutionPermit, GatewayError> {
        let permit_id = Uuid::new_v4();
        let payload = AgentActionPayload {
            permit_id,
            action,
            classification: classification.level,
            matched_patterns: classification.matched_ids(),
            decision_path,
            executed: false,
            outcome: None,
        };
        let receipt =
            receipts::record(&self.ledger, episode_id, &payload, Temporal::observed_now())?;

        tracing::info!(
            episode_id = %episode_id,
            %permit_id,
            tool = %payload.action.tool,
            level = %classification.level,
            path = ?payload.decision_path,
            "action permitted"
        );

        Ok(ExecutionPermit {
            permit_id,
            episode_id: episode_id.to_string(),
            action: payload.action,
            classification,
            decision_path: payload.decision_path,
            receipt,
        })
    }

    fn refuse_decision(
        &self,
        request: &ActionRequest,
        classification: Classification,
        code: RefusalCode,
        citation: String,
    ) -> Result<Decision, GatewayError> {
        let refusal = self.refuse(
            &request.episode_id,
            &request.action,
            classification,
            code,
            citation,
        )?;
        Ok(Decision::Refused(refusal))
    }

    fn refuse(
        &self,
        episode_id: &str,
        action: &ToolAction,
        classification: Classification,
        code: RefusalCode,
        citation: String,
    ) -> Result<Refusal, GatewayError> {
        let safer_alternative = classification
            .safer_alternative()
            .map(str::to_string)
            .or_else(|| generic_alternative(code).map(str::to_string));
        let payload = RefusalPayload {
            action: action.clone(),
            classification: classification.level,
            matched_patterns: classification.matched_ids(),
            reason_code: code,
            citation,
            safer_alternative,
        };
        let receipt =
            receipts::record(&self.ledger, episode_id, &payload, Temporal::observed_now())?;

        tracing::warn!(
            episode_id = %episode_id,
            tool = %action.tool,
            level = %classification.level,
            reason_code = %code,
            citation = %payload.citation,
            "action refused"
        );

        Ok(Refusal {
            code,
            citation: payload.citation,
            safer_alternative: payload.safer_alternative,
            classification,
            receipt,
        })
    }
}

fn generic_alternative(code: RefusalCode) -> Option<&'static str> {
    Some(match code {
        RefusalCode::NoPlan | RefusalCode::PlanExpired => {
            "submit a plan covering this step for Guardian review, \
             or request a capability token scoped to it"
        }
        RefusalCode::NoVerdict | RefusalCode::AuthorizationPending => {
            "retry once the Guardian has returned a verdict for the plan"
        }
        RefusalCode::PlanHashMismatch => "resubmit the plan and authorize it again",
        RefusalCode::VerdictEscalated => {
            "have a reviewer resolve the escalation, or authorize the plan again \
             to retry the escalation resolver"
        }
        RefusalCode::ScopeMismatch => {
            "keep the action within the authorized tool and scope, \
             or submit a plan for the wider scope"
        }
        RefusalCode::TokenExpired
        | RefusalCode::TokenReplay
        | RefusalCode::TokenPrincipalMismatch
        | RefusalCode::TokenScopeMismatch
        | RefusalCode::TokenSignatureInvalid
        | RefusalCode::TokenRevoked => {
            "request a fresh capability token for this principal, tool, and scope"
        }
        RefusalCode::VerdictDeny | RefusalCode::TokenReplayStoreUnavailable => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use csp_ledger::MemoryReceiptStore;
    use csp_policy::{GuardianError, GuardianVerdict, PlanHash};

    struct Unreachable;

    impl Guardian for Unreachable {
        fn evaluate(
            &self,
            _plan: &ToolPlan,
            _plan_hash: &PlanHash,
        ) -> Result<GuardianVerdict, GuardianError> {
            Err(GuardianError::Unavailable {
                reason: "connection refused".to_string(),
            })
        }
    }

    fn gate(tier: ConformanceTier) -> Gatekeeper {
        let mut config = GatewayConfig::for_project("/nonexistent");
        config.tier = tier;
        Gatekeeper::builder(config, Arc::new(Unreachable))
            .store(Arc::new(MemoryReceiptStore::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn authorization_threshold_follows_tier() {
        let basic = gate(ConformanceTier::Basic);
        assert!(!basic.requires_authorization(RiskLevel::High));
        assert!(basic.requires_authorization(RiskLevel::Critical));

        let standard = gate(ConformanceTier::Standard);
        assert!(!standard.requires_authorization(RiskLevel::Medium));
        assert!(standard.requires_authorization(RiskLevel::High));
    }

    #[test]
    fn tokens_are_refused_without_a_verifier() {
        let gate = gate(ConformanceTier::Standard);
        let issuer = csp_policy::CapabilityIssuer::new(
            Arc::new(csp_ledger::HmacKeyring::new("k", b"secret")),
            "ops",
        );
        let token = issuer
            .mint(csp_policy::TokenRequest::new("agent", "deploy", "/srv/app"))
            .unwrap();
        let action = ToolAction::new("deploy", "/srv/app").with_requested_risk(RiskLevel::High);
        let decision = gate
            .evaluate(ActionRequest::new("ep", "agent", action).with_token(token))
            .unwrap();
        assert_eq!(
            decision.refusal().unwrap().code,
            RefusalCode::TokenSignatureInvalid
        );
    }

    #[test]
    fn unavailable_guardian_leaves_a_refusal_receipt() {
        let gate = gate(ConformanceTier::Standard);
        let plan = gate
            .submit_plan(
                "ep",
                "agent",
                "deploy",
                vec![PlanStep::new("deploy", "/srv/app", RiskLevel::High)],
            )
            .unwrap();
        let outcome = gate.authorize_plan(plan.plan_id).unwrap();
        assert!(matches!(outcome, AuthorizationOutcome::Refused(_)));

        let receipts = gate.ledger().episode("ep").unwrap();
        let refusal: RefusalPayload = receipts.last().unwrap().payload_as().unwrap();
        assert_eq!(refusal.reason_code, RefusalCode::NoVerdict);
        assert!(refusal.citation.contains("connection refused"));
        assert!(refusal.safer_alternative.is_some());
    }

    #[test]
    fn unknown_plan_cannot_be_authorized() {
        let gate = gate(ConformanceTier::Standard);
        assert!(matches!(
            gate.authorize_plan(Uuid::new_v4()),
            Err(GatewayError::Policy(csp_policy::PolicyError::PlanNotFound { .. }))
        ));
    }

    struct Notary;

    impl AnchorService for Notary {
        fn name(&self) -> &str {
            "notary"
        }

        fn anchor(&self, merkle_root: &str) -> Result<String, csp_ledger::LedgerError> {
            Ok(format!("stamp:{}", merkle_root))
        }
    }

    #[test]
    fn anchoring_covers_the_episode_so_far() {
        let gate = gate(ConformanceTier::Standard);
        let action = ToolAction::new("read_file", "/srv/app/README.md");
        let _ = gate.evaluate(ActionRequest::new("ep", "agent", action)).unwrap();

        let anchor = gate.anchor_episode("ep", &Notary).unwrap();
        assert_eq!(anchor.kind, ReceiptKind::Anchor);
        let payload: csp_ledger::AnchorPayload = anchor.payload_as().unwrap();
        assert_eq!(payload.covered_receipt_ids.len(), 1);
        assert!(payload.proof.starts_with("stamp:"));
        assert!(gate.verify_episode("ep").unwrap().is_valid());
    }
}
