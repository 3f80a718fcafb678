//! Rule-based action classification.
//!
//! Every tool call is tiered before execution.  The configured rule lists
//! are walked in order auto-approve → notify → require-approval; the
//! first tier containing a matching rule wins.  Anything unmatched
//! defaults to require-approval, so an unknown or misconfigured tool can
//! never run unattended.

pub mod glob;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::schema::{ActionTiersConfig, TierRule};

/// Tool name that is always require-approval and exempt from
/// session-grant downgrades.
pub const SOUL_UPDATE_TOOL: &str = "propose_soul_update";

// ─── ActionTier ───────────────────────────────────────────────────────────────

/// The gate tier assigned to a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionTier {
    AutoApprove,
    Notify,
    RequireApproval,
}

impl ActionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTier::AutoApprove => "auto-approve",
            ActionTier::Notify => "notify",
            ActionTier::RequireApproval => "require-approval",
        }
    }
}

// ─── Classification ───────────────────────────────────────────────────────────

/// Classify a tool call against the configured tiers.
///
/// Walks auto-approve → notify → require-approval and returns the first
/// tier with a matching rule; unmatched calls fall through to
/// [`ActionTier::RequireApproval`].
pub fn classify(tool_name: &str, input: &Value, tiers: &ActionTiersConfig) -> ActionTier {
    // Soul updates are hard-wired: no rule list can downgrade them.
    if tool_name == SOUL_UPDATE_TOOL {
        return ActionTier::RequireApproval;
    }

    let ordered: [(&[TierRule], ActionTier); 3] = [
        (tiers.auto_approve.as_slice(), ActionTier::AutoApprove),
        (tiers.notify.as_slice(), ActionTier::Notify),
        (tiers.require_approval.as_slice(), ActionTier::RequireApproval),
    ];

    for (rules, tier) in ordered {
        if rules.iter().any(|r| rule_matches(r, tool_name, input)) {
            return tier;
        }
    }

    ActionTier::RequireApproval
}

/// A rule matches when the tool name is equal and every condition field
/// exists (non-null) on the input with a string value matching its glob.
fn rule_matches(rule: &TierRule, tool_name: &str, input: &Value) -> bool {
    if rule.tool != tool_name {
        return false;
    }
    rule.conditions.iter().all(|(field, pattern)| {
        match input.get(field) {
            Some(Value::Null) | None => false,
            Some(value) => glob::matches(&coerce_to_string(value), pattern),
        }
    })
}

/// String-coerce a JSON value the way rule conditions see it.
fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Implicit auto-approve rules for `browse_web` toward the configured
/// trusted domains.  One rule pair per domain: the bare origin and
/// everything under it.
pub fn trusted_domain_rules(domains: &[String]) -> Vec<TierRule> {
    let mut rules = Vec::with_capacity(domains.len() * 2);
    for domain in domains {
        for pattern in [
            format!("https://{domain}"),
            format!("https://{domain}/**"),
        ] {
            let mut conditions = std::collections::HashMap::new();
            conditions.insert("url".to_string(), pattern);
            rules.push(TierRule {
                tool: "browse_web".to_string(),
                conditions,
            });
        }
    }
    rules
}

// ─── Tests ────────────────────────────────────────────────────────────────────
