// classify.rs — Classify a proposed action with the configured pattern set.

use clap::Args;
use csp_gateway::GatewayConfig;
use csp_policy::{RiskClassifier, RiskLevel, ToolAction, ToolRiskTable};

#[derive(Args)]
pub struct ClassifyArgs {
    /// Tool name (e.g. shell, sql, http).
    #[arg(long, default_value = "shell")]
    tool: String,
    /// Target scope the action touches.
    #[arg(long, default_value = "/")]
    scope: String,
    /// Risk hint supplied by the caller.
    #[arg(long)]
    risk: Option<RiskLevel>,
    /// Print the full classification as JSON.
    #[arg(long)]
    json: bool,
    /// Command text.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

pub fn execute(args: &ClassifyArgs, config: &GatewayConfig) -> anyhow::Result<()> {
    let classifier = classifier_for(config)?;

    let mut action = ToolAction::new(&args.tool, &args.scope);
    if !args.command.is_empty() {
        action = action.with_command(args.command.join(" "));
    }
    if let Some(level) = args.risk {
        action = action.with_requested_risk(level);
    }

    let classification = classifier.classify(&action);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&classification)?);
        return Ok(());
    }

    println!("Risk: {}", classification.level);
    for m in &classification.matched_patterns {
        let marker = if m.default { "default" } else { "extra" };
        println!("  matched {} [{}]: {}", m.id, marker, m.description);
    }
    for hint in &classification.hints {
        println!("  hint {}: {}", hint.source, hint.level);
    }
    if let Some(alternative) = classification.safer_alternative() {
        println!("Safer alternative: {}", alternative);
    }
    Ok(())
}

/// The classifier a gateway with this configuration would use.
fn classifier_for(config: &GatewayConfig) -> anyhow::Result<RiskClassifier> {
    let mut classifier = RiskClassifier::with_defaults()?;
    for spec in &config.extra_patterns {
        classifier.register_pattern(spec.clone())?;
    }
    if !config.tool_risk.is_empty() {
        classifier.add_heuristic(Box::new(ToolRiskTable::from(config.tool_risk.clone())));
    }
    Ok(classifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use csp_policy::PatternSpec;

    #[test]
    fn configured_patterns_and_tool_risk_apply() {
        let mut config = GatewayConfig::for_project("/nonexistent");
        config.tool_risk.insert("sql".to_string(), RiskLevel::Medium);
        config.extra_patterns.push(PatternSpec::new(
            "force_push",
            r"git\s+push\s+.*--force",
            "force push",
        ));
        let classifier = classifier_for(&config).unwrap();

        let select = ToolAction::new("sql", "db://prod/users").with_command("SELECT 1");
        assert_eq!(classifier.classify(&select).level, RiskLevel::Medium);

        let push = ToolAction::new("shell", "/repo").with_command("git push origin main --force");
        let classification = classifier.classify(&push);
        assert_eq!(classification.level, RiskLevel::Critical);
        assert_eq!(classification.matched_ids(), vec!["force_push".to_string()]);
    }
}
