//! Provider reply parsing into typed responses.
//!
//! Text-producing providers (language models, human input forms) return
//! free text, ideally a JSON object such as
//!
//! ```json
//! {"institution_choice": "SI", "reasoning": "..."}
//! {"contribution": 12, "reasoning": "..."}
//! {"punishments": {"3": 2}, "rewards": {"5": 1}, "reasoning": "..."}
//! ```
//!
//! This module extracts and types that object for the requested phase.
//! Text no strategy can parse is a [`ProviderError::Malformed`]; the gateway
//! then substitutes the configured default.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde_json::Value;
use tracing::warn;

use commons_types::{
    AgentId, InstitutionKind, PhaseKind, ProviderDecision, ProviderResponse, SanctionIntent,
    SanctionKind,
};

use crate::gateway::ProviderError;

/// Intermediate shape of a provider's JSON reply.
#[derive(Debug, Default, serde::Deserialize)]
struct RawReply {
    #[serde(default, alias = "institution")]
    institution_choice: Option<String>,
    #[serde(default)]
    contribution: Option<Value>,
    #[serde(default)]
    punishments: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    rewards: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse provider text into a [`ProviderResponse`] for `phase`.
///
/// Attempts multiple recovery strategies if the raw text is not clean JSON:
/// 1. Direct deserialization
/// 2. Extract JSON from a markdown code block
/// 3. Strip trailing commas and retry
/// 4. Take the outermost `{ ... }` span of surrounding prose
///
/// # Errors
///
/// Returns [`ProviderError::Malformed`] if no strategy yields an object with
/// the field the phase requires.
pub fn parse_provider_reply(phase: PhaseKind, raw: &str) -> Result<ProviderResponse, ProviderError> {
    let reply = extract_reply(raw)?;
    let reasoning = reply.reasoning.clone().unwrap_or_default();

    let decision = match phase {
        PhaseKind::InstitutionChoice => {
            let code = reply
                .institution_choice
                .as_deref()
                .ok_or_else(|| malformed("missing 'institution_choice'"))?;
            let kind = InstitutionKind::from_code(code)
                .ok_or_else(|| malformed(format!("unknown institution '{code}'")))?;
            ProviderDecision::InstitutionChoice(kind)
        }
        PhaseKind::Contribution => {
            let value = reply
                .contribution
                .as_ref()
                .ok_or_else(|| malformed("missing 'contribution'"))?;
            let amount = value_to_i64(value)
                .ok_or_else(|| malformed(format!("contribution is not a number: {value}")))?;
            ProviderDecision::Contribution(amount)
        }
        PhaseKind::Sanctioning => {
            let mut intents = sanction_intents(reply.punishments.as_ref(), SanctionKind::Punish);
            intents.extend(sanction_intents(reply.rewards.as_ref(), SanctionKind::Reward));
            ProviderDecision::Sanctions(intents)
        }
    };

    Ok(ProviderResponse::new(decision, reasoning))
}

/// Run the recovery strategies until one deserializes.
fn extract_reply(raw: &str) -> Result<RawReply, ProviderError> {
    let trimmed = raw.trim();

    // Strategy 1: direct parse
    if let Ok(reply) = serde_json::from_str::<RawReply>(trimmed) {
        return Ok(reply);
    }

    // Strategy 2: markdown code block
    if let Some(block) = extract_json_from_codeblock(trimmed) {
        if let Ok(reply) = serde_json::from_str::<RawReply>(block) {
            return Ok(reply);
        }
        if let Ok(reply) = serde_json::from_str::<RawReply>(&strip_trailing_commas(block)) {
            return Ok(reply);
        }
    }

    // Strategy 3: trailing commas
    if let Ok(reply) = serde_json::from_str::<RawReply>(&strip_trailing_commas(trimmed)) {
        return Ok(reply);
    }

    // Strategy 4: outermost braces inside prose
    if let Some(span) = outermost_object(trimmed)
        && let Ok(reply) = serde_json::from_str::<RawReply>(&strip_trailing_commas(span))
    {
        return Ok(reply);
    }

    Err(malformed(format!("all parse strategies failed for: {trimmed}")))
}

fn malformed(message: impl Into<String>) -> ProviderError {
    ProviderError::Malformed {
        message: message.into(),
    }
}

/// Convert a `{agent: amount}` map into intents, in ascending agent order.
/// The order of keys in the reply is not kept; under the clamp budget
/// policy this is the order the budget is spent in.
fn sanction_intents(map: Option<&BTreeMap<String, Value>>, kind: SanctionKind) -> Vec<SanctionIntent> {
    let Some(map) = map else {
        return Vec::new();
    };
    let mut intents: Vec<SanctionIntent> = map
        .iter()
        .filter_map(|(key, value)| {
            let target = parse_agent_key(key);
            let amount = value_to_i64(value);
            if target.is_none() || amount.is_none() {
                warn!(key = %key, value = %value, "ignoring unparseable sanction entry");
            }
            Some(SanctionIntent {
                target: target?,
                kind,
                amount: amount?,
            })
        })
        .collect();
    intents.sort_by_key(|i| i.target);
    intents
}

/// Accept `"3"`, `"agent_3"`, `"Agent 3"` and similar.
fn parse_agent_key(key: &str) -> Option<AgentId> {
    key.trim()
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse::<u32>()
        .ok()
        .map(AgentId)
}

/// Read an integer from a JSON number or numeric string, truncating
/// fractions and saturating out-of-range values.
fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|_| i64::MAX))
            .or_else(|| n.as_f64().and_then(float_to_i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| Decimal::from_str(s).ok().map(decimal_to_i64))
        }
        _ => None,
    }
}

fn float_to_i64(f: f64) -> Option<i64> {
    if !f.is_finite() {
        return None;
    }
    let saturated = if f.is_sign_negative() { i64::MIN } else { i64::MAX };
    Some(Decimal::from_f64(f).map_or(saturated, decimal_to_i64))
}

fn decimal_to_i64(d: Decimal) -> i64 {
    d.trunc().to_i64().unwrap_or(if d.is_sign_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Extract the body of the first ```` ```json ```` or ```` ``` ```` block.
fn extract_json_from_codeblock(text: &str) -> Option<&str> {
    let fence = text.find("```")?;
    let after_fence = text.get(fence.checked_add(3)?..)?;
    let body_start = after_fence.find('\n').and_then(|nl| nl.checked_add(1)).unwrap_or(0);
    let body = after_fence.get(body_start..)?;
    let end = body.find("```")?;
    body.get(..end).map(str::trim)
}

/// The span from the first `{` to the last `}`.
fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    text.get(start..=end)
}

/// Strip trailing commas before closing braces and brackets. Text inside
/// JSON strings is left alone.
fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if *c == '\\' {
                escaped = true;
            } else if *c == '"' {
                in_string = false;
            }
        } else if *c == '"' {
            in_string = true;
        } else if *c == ',' {
            let next = chars
                .iter()
                .skip(i.saturating_add(1))
                .find(|n| !n.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        result.push(*c);
    }

    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_institution_choice() {
        let reply = r#"{"institution_choice": "SI", "reasoning": "punish free riders"}"#;
        let response = parse_provider_reply(PhaseKind::InstitutionChoice, reply).unwrap();
        assert_eq!(
            response.decision,
            ProviderDecision::InstitutionChoice(InstitutionKind::Sanctioning)
        );
        assert_eq!(response.reasoning, "punish free riders");
    }

    #[test]
    fn unknown_institution_is_malformed() {
        let reply = r#"{"institution_choice": "both"}"#;
        let result = parse_provider_reply(PhaseKind::InstitutionChoice, reply);
        assert!(matches!(result, Err(ProviderError::Malformed { .. })));
    }

    #[test]
    fn parses_contribution_from_code_block() {
        let reply = "Here is my answer:\n```json\n{\"contribution\": 14, \"reasoning\": \"ok\",}\n```";
        let response = parse_provider_reply(PhaseKind::Contribution, reply).unwrap();
        assert_eq!(response.decision, ProviderDecision::Contribution(14));
    }

    #[test]
    fn contribution_accepts_strings_and_fractions() {
        let response =
            parse_provider_reply(PhaseKind::Contribution, r#"{"contribution": "7.9"}"#).unwrap();
        assert_eq!(response.decision, ProviderDecision::Contribution(7));

        let response =
            parse_provider_reply(PhaseKind::Contribution, r#"{"contribution": 12.5}"#).unwrap();
        assert_eq!(response.decision, ProviderDecision::Contribution(12));

        let response =
            parse_provider_reply(PhaseKind::Contribution, r#"{"contribution": -4}"#).unwrap();
        assert_eq!(response.decision, ProviderDecision::Contribution(-4));
    }

    #[test]
    fn missing_contribution_is_malformed() {
        let result = parse_provider_reply(PhaseKind::Contribution, r#"{"reasoning": "hmm"}"#);
        assert!(matches!(result, Err(ProviderError::Malformed { .. })));
    }

    #[test]
    fn parses_sanctions_from_prose() {
        let reply = r#"I will punish agent 3. {"punishments": {"agent_3": 4, "10": 1}, "rewards": {"2": 2}} Thanks."#;
        let response = parse_provider_reply(PhaseKind::Sanctioning, reply).unwrap();
        let ProviderDecision::Sanctions(intents) = response.decision else {
            return;
        };
        assert_eq!(
            intents,
            vec![
                SanctionIntent {
                    target: AgentId(3),
                    kind: SanctionKind::Punish,
                    amount: 4,
                },
                SanctionIntent {
                    target: AgentId(10),
                    kind: SanctionKind::Punish,
                    amount: 1,
                },
                SanctionIntent {
                    target: AgentId(2),
                    kind: SanctionKind::Reward,
                    amount: 2,
                },
            ]
        );
    }

    #[test]
    fn empty_sanction_object_means_no_sanctions() {
        let response = parse_provider_reply(PhaseKind::Sanctioning, "{}").unwrap();
        assert_eq!(response.decision, ProviderDecision::Sanctions(Vec::new()));
    }

    #[test]
    fn garbage_is_malformed() {
        let result = parse_provider_reply(PhaseKind::Contribution, "I refuse to answer.");
        assert!(matches!(result, Err(ProviderError::Malformed { .. })));
    }

    #[test]
    fn strip_trailing_commas_basic() {
        assert_eq!(strip_trailing_commas(r#"{"a": 1, "b": 2,}"#), r#"{"a": 1, "b": 2}"#);
        assert_eq!(strip_trailing_commas("[1, 2, 3,\n]"), "[1, 2, 3\n]");
    }

    #[test]
    fn strip_trailing_commas_leaves_strings_alone() {
        assert_eq!(
            strip_trailing_commas(r#"{"reasoning": "a,}", "b": [1,],}"#),
            r#"{"reasoning": "a,}", "b": [1]}"#
        );
        assert_eq!(
            strip_trailing_commas(r#"{"reasoning": "say \"x,]\" twice",}"#),
            r#"{"reasoning": "say \"x,]\" twice"}"#
        );
        assert_eq!(
            strip_trailing_commas(r#"{"reasoning": "ends in \\", "c": 1,}"#),
            r#"{"reasoning": "ends in \\", "c": 1}"#
        );
    }

    #[test]
    fn reasoning_with_comma_brace_survives_recovery() {
        let reply = "```json\n{\"contribution\": 9, \"reasoning\": \"fair, }\",}\n```";
        let response = parse_provider_reply(PhaseKind::Contribution, reply).unwrap();
        assert_eq!(response.decision, ProviderDecision::Contribution(9));
        assert_eq!(response.reasoning, "fair, }");
    }

    #[test]
    fn sanctions_are_listed_punishments_first_by_target() {
        let reply = r#"{"rewards": {"4": 1, "1": 2}, "punishments": {"9": 3, "2": 1}}"#;
        let response = parse_provider_reply(PhaseKind::Sanctioning, reply).unwrap();
        let ProviderDecision::Sanctions(intents) = response.decision else {
            return;
        };
        let order: Vec<(SanctionKind, u32)> =
            intents.iter().map(|i| (i.kind, i.target.0)).collect();
        assert_eq!(
            order,
            vec![
                (SanctionKind::Punish, 2),
                (SanctionKind::Punish, 9),
                (SanctionKind::Reward, 1),
                (SanctionKind::Reward, 4),
            ]
        );
    }

    #[test]
    fn agent_keys() {
        assert_eq!(parse_agent_key("4"), Some(AgentId(4)));
        assert_eq!(parse_agent_key("Agent 12"), Some(AgentId(12)));
        assert_eq!(parse_agent_key("nobody"), None);
    }
}
