use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Value, json};

use crate::agent::dispatch::LOAD_SKILL_TOOL;
use crate::llm::provider::{AssistantMessage, AssistantPart, AssistantRole};

/// Text of the most recent user message that carries any, or `""`.
pub fn latest_user_text(history: &[AssistantMessage]) -> String {
    history
        .iter()
        .rev()
        .filter(|message| message.role == AssistantRole::User)
        .find_map(|message| {
            let text = message
                .parts
                .iter()
                .filter_map(|part| match part {
                    AssistantPart::Text { text, .. } if !text.trim().is_empty() => {
                        Some(text.trim())
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        })
        .unwrap_or_default()
}

/// Skills the conversation has attempted to load, mapped to whether the load
/// found them. Calls are paired with responses by id, falling back to order
/// for providers that omit ids. The latest attempt for a name wins.
///
/// A successful load is recorded under the requested id, the skill's
/// frontmatter name and its directory id, since loads resolve either form.
pub fn loaded_skills(history: &[AssistantMessage]) -> BTreeMap<String, bool> {
    let mut calls: Vec<(Option<&str>, String)> = Vec::new();
    let mut responses: Vec<(Option<&str>, &Value)> = Vec::new();

    for part in history.iter().flat_map(|message| message.parts.iter()) {
        match part {
            AssistantPart::FunctionCall {
                id,
                name,
                args_json,
                ..
            } if name == LOAD_SKILL_TOOL => {
                if let Some(skill) = requested_skill(args_json) {
                    calls.push((id.as_deref(), skill));
                }
            }
            AssistantPart::FunctionResponse {
                id,
                name,
                response_json,
                ..
            } if name == LOAD_SKILL_TOOL => responses.push((id.as_deref(), response_json)),
            _ => {}
        }
    }

    let mut loaded = BTreeMap::new();
    let mut unmatched = responses.iter().filter(|(id, _)| id.is_none());
    for (call_id, skill) in calls {
        let response = match call_id {
            Some(call_id) => responses
                .iter()
                .find(|(id, _)| *id == Some(call_id))
                .map(|(_, response)| *response),
            None => unmatched.next().map(|(_, response)| *response),
        };
        let Some(response) = response else {
            continue;
        };
        let result = load_result(response);
        let found = result.get("found").and_then(Value::as_bool).unwrap_or(false);
        if found {
            for alias in resolved_ids(&result) {
                loaded.insert(alias, true);
            }
        }
        loaded.insert(skill, found);
    }
    loaded
}

fn requested_skill(args: &Value) -> Option<String> {
    ["name", "skill_id", "skill"]
        .iter()
        .find_map(|key| args.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
}

/// The load result inside a response, unwrapping JSON-encoded text and the
/// `{"ok", "result"}` envelope.
fn load_result(response: &Value) -> Value {
    match response {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) if !parsed.is_string() => load_result(&parsed),
            _ => json!({ "found": text.to_lowercase().contains("\"found\": true") }),
        },
        Value::Object(map) if !map.contains_key("found") => map
            .get("result")
            .filter(|result| result.is_object())
            .cloned()
            .unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// Frontmatter name and directory id of a found skill.
fn resolved_ids(result: &Value) -> Vec<String> {
    let name = result.get("name").and_then(Value::as_str);
    let dir_id = result
        .get("path")
        .and_then(Value::as_str)
        .and_then(|path| Path::new(path).parent())
        .and_then(Path::file_name)
        .and_then(|dir| dir.to_str());
    [name, dir_id]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{latest_user_text, loaded_skills};
    use crate::llm::provider::{AssistantMessage, AssistantPart, AssistantRole};
    use serde_json::{Value, json};

    fn call(id: Option<&str>, name: &str, args: Value) -> AssistantMessage {
        AssistantMessage {
            role: AssistantRole::Model,
            parts: vec![AssistantPart::FunctionCall {
                id: id.map(ToOwned::to_owned),
                name: name.to_string(),
                args_json: args,
                thought_signature: None,
            }],
        }
    }

    fn response(id: Option<&str>, name: &str, body: Value) -> AssistantMessage {
        AssistantMessage {
            role: AssistantRole::User,
            parts: vec![AssistantPart::FunctionResponse {
                id: id.map(ToOwned::to_owned),
                name: name.to_string(),
                response_json: body,
                thought_signature: None,
            }],
        }
    }

    #[test]
    fn latest_user_text_skips_tool_responses() {
        let history = vec![
            AssistantMessage::user_text("first question"),
            call(Some("c1"), "list_skills", json!({})),
            response(Some("c1"), "list_skills", json!({"ok": true})),
        ];
        assert_eq!(latest_user_text(&history), "first question");
        assert_eq!(latest_user_text(&[]), "");
    }

    #[test]
    fn loaded_skills_pairs_by_id_and_reads_found() {
        let history = vec![
            AssistantMessage::user_text("q"),
            call(Some("a"), "load_skill", json!({"name": "ma_cross"})),
            call(Some("b"), "load_skill", json!({"name": "ghost"})),
            response(Some("b"), "load_skill", json!({"ok": true, "result": {"found": false}})),
            response(Some("a"), "load_skill", json!({"ok": true, "result": {"found": true}})),
        ];

        let loaded = loaded_skills(&history);
        assert_eq!(loaded.get("ma_cross"), Some(&true));
        assert_eq!(loaded.get("ghost"), Some(&false));
    }

    #[test]
    fn loaded_skills_pairs_id_less_calls_in_order() {
        let history = vec![
            call(None, "load_skill", json!({"name": "one"})),
            response(None, "load_skill", json!({"found": true})),
            call(None, "load_skill", json!({"name": "two"})),
            response(None, "load_skill", Value::String("{\"found\": false}".to_string())),
        ];

        let loaded = loaded_skills(&history);
        assert_eq!(loaded.get("one"), Some(&true));
        assert_eq!(loaded.get("two"), Some(&false));
    }

    #[test]
    fn calls_without_responses_are_ignored() {
        let history = vec![call(Some("a"), "load_skill", json!({"name": "pending"}))];
        assert!(loaded_skills(&history).is_empty());
    }

    #[test]
    fn loading_by_frontmatter_name_also_admits_the_directory_id() {
        let history = vec![
            call(Some("a"), "load_skill", json!({"skill_id": "Moving Average Cross"})),
            response(
                Some("a"),
                "load_skill",
                json!({"ok": true, "result": {
                    "found": true,
                    "name": "Moving Average Cross",
                    "path": "/skills/ma_cross/SKILL.md",
                }}),
            ),
        ];

        let loaded = loaded_skills(&history);
        assert_eq!(loaded.get("ma_cross"), Some(&true));
        assert_eq!(loaded.get("Moving Average Cross"), Some(&true));
    }

    #[test]
    fn failed_loads_record_only_the_requested_id() {
        let history = vec![
            call(Some("a"), "load_skill", json!({"skill_id": "ghost"})),
            response(
                Some("a"),
                "load_skill",
                json!({"ok": true, "result": {"found": false, "name": "ghost"}}),
            ),
        ];

        let loaded = loaded_skills(&history);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("ghost"), Some(&false));
    }
}
