use std::borrow::Cow;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::guard::{PythonGuard, declared_skills};
use crate::llm::provider::{AssistantMessage, AssistantPart, AssistantRole, FunctionDeclaration};
use crate::sandbox::{ExecutionRequest, Sandbox};
use crate::skills::{DEFAULT_SEARCH_LIMIT, SkillCatalog};

use super::lookup::{self, LOOKUP_TOOLS};

pub const EXECUTE_PYTHON_TOOL: &str = "execute_python";
pub const CLEAR_PYTHON_SESSION_TOOL: &str = "clear_python_session";
pub const LIST_SKILLS_TOOL: &str = "list_skills";
pub const SEARCH_SKILLS_TOOL: &str = "search_skills";
pub const LOAD_SKILL_TOOL: &str = "load_skill";

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallSpec {
    pub id: Option<String>,
    pub name: String,
    pub args_json: Value,
}

/// Everything a tool call may touch, scoped to one conversation.
#[derive(Clone)]
pub struct ToolContext {
    pub sandbox: Arc<Sandbox>,
    pub skills: SkillCatalog,
    pub guard: PythonGuard,
    pub session_id: String,
}

pub fn tool_declarations() -> Vec<FunctionDeclaration> {
    let mut tools = vec![
        FunctionDeclaration {
            name: EXECUTE_PYTHON_TOOL.to_string(),
            description: "Run Python analysis code against the stock data handle `store` with pandas (pd) and numpy (np) preloaded. Variables persist across calls in this conversation. Assign the final value to `result`. Only for calculations; load the relevant skills first and list them in skills_used.".to_string(),
            parameters_json_schema: json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Python source to execute"},
                    "skills_used": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Ids of the skills loaded with load_skill that this code follows"
                    }
                },
                "required": ["code", "skills_used"]
            }),
        },
        FunctionDeclaration {
            name: CLEAR_PYTHON_SESSION_TOOL.to_string(),
            description: "Discard every variable defined by execute_python in this conversation.".to_string(),
            parameters_json_schema: json!({"type": "object", "properties": {}}),
        },
        FunctionDeclaration {
            name: LIST_SKILLS_TOOL.to_string(),
            description: "List available analysis skills with their ids, names, descriptions and tags.".to_string(),
            parameters_json_schema: json!({"type": "object", "properties": {}}),
        },
        FunctionDeclaration {
            name: SEARCH_SKILLS_TOOL.to_string(),
            description: "Find the skills most relevant to a question or subtask.".to_string(),
            parameters_json_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "description": "Maximum skills to return, 1 to 3 is usually enough"}
                },
                "required": ["query"]
            }),
        },
        FunctionDeclaration {
            name: LOAD_SKILL_TOOL.to_string(),
            description: "Load the full guidance of one skill by id or name.".to_string(),
            parameters_json_schema: json!({
                "type": "object",
                "properties": {"skill_id": {"type": "string"}},
                "required": ["skill_id"]
            }),
        },
    ];
    tools.extend(LOOKUP_TOOLS.iter().map(lookup::LookupTool::declaration));
    tools
}

/// Runs calls in order. Each guarded call sees the conversation plus the
/// responses already produced in this turn, so a `load_skill` issued just
/// before `execute_python` counts.
pub async fn dispatch_calls(
    ctx: &ToolContext,
    history: &[AssistantMessage],
    calls: &[FunctionCallSpec],
) -> Vec<AssistantPart> {
    let mut responses: Vec<AssistantPart> = Vec::with_capacity(calls.len());
    for call in calls {
        let seen: Cow<'_, [AssistantMessage]> = if responses.is_empty() {
            Cow::Borrowed(history)
        } else {
            let mut seen = history.to_vec();
            seen.push(AssistantMessage {
                role: AssistantRole::User,
                parts: responses.clone(),
            });
            Cow::Owned(seen)
        };

        let response_json = ctx
            .guard
            .wrap_tool_call_async(&seen, call, |call| dispatch_one(ctx, call))
            .await;
        responses.push(AssistantPart::FunctionResponse {
            id: call.id.clone(),
            name: call.name.clone(),
            response_json,
            thought_signature: None,
        });
    }
    responses
}

async fn dispatch_one(ctx: &ToolContext, call: FunctionCallSpec) -> Value {
    match call.name.as_str() {
        EXECUTE_PYTHON_TOOL => dispatch_execute_python(ctx, &call).await,
        CLEAR_PYTHON_SESSION_TOOL => {
            let cleared = ctx.sandbox.clear_session(Some(&ctx.session_id));
            ok_envelope(json!({ "cleared": cleared, "session_id": ctx.session_id }))
        }
        LIST_SKILLS_TOOL => match ctx.skills.list() {
            Ok(rows) => ok_envelope(json!({ "count": rows.len(), "rows": rows })),
            Err(err) => error_envelope("skills_unavailable", err.to_string(), json!({})),
        },
        SEARCH_SKILLS_TOOL => dispatch_search_skills(ctx, &call),
        LOAD_SKILL_TOOL => dispatch_load_skill(ctx, &call),
        name => match lookup::find(name) {
            Some(tool) => tool.run(ctx.sandbox.clone(), &call.args_json).await,
            None => error_envelope(
                "unknown_function",
                format!("unknown function: {}", call.name),
                json!({}),
            ),
        },
    }
}

/// Returns the flat execution outcome with `skills_used` echoed back.
async fn dispatch_execute_python(ctx: &ToolContext, call: &FunctionCallSpec) -> Value {
    let skills_used = declared_skills(&call.args_json);
    let Some(code) = call.args_json.get("code").and_then(Value::as_str) else {
        return json!({
            "success": false,
            "output": null,
            "error": "invalid arguments: `code` must be a string",
            "result": null,
            "skills_used": skills_used,
        });
    };

    let request = ExecutionRequest::new(code)
        .in_session(ctx.session_id.clone())
        .with_skills(skills_used.clone());
    let outcome = ctx.sandbox.clone().execute_async(request).await;

    let mut response = serde_json::to_value(&outcome).unwrap_or_else(|err| {
        json!({ "success": false, "error": format!("failed to encode outcome: {err}") })
    });
    if let Some(fields) = response.as_object_mut() {
        fields.insert("skills_used".to_string(), json!(skills_used));
    }
    response
}

fn dispatch_search_skills(ctx: &ToolContext, call: &FunctionCallSpec) -> Value {
    let Some(query) = call.args_json.get("query").and_then(Value::as_str) else {
        return error_envelope(
            "invalid_args",
            "search_skills requires a string `query`",
            json!({ "args": call.args_json }),
        );
    };
    let limit = call
        .args_json
        .get("limit")
        .and_then(Value::as_u64)
        .and_then(|limit| usize::try_from(limit).ok())
        .unwrap_or(DEFAULT_SEARCH_LIMIT);

    match ctx.skills.search(query, limit) {
        Ok(rows) => ok_envelope(json!({ "query": query, "count": rows.len(), "rows": rows })),
        Err(err) => error_envelope("skills_unavailable", err.to_string(), json!({})),
    }
}

fn dispatch_load_skill(ctx: &ToolContext, call: &FunctionCallSpec) -> Value {
    let Some(skill_id) = ["skill_id", "name", "skill"]
        .iter()
        .find_map(|key| call.args_json.get(*key).and_then(Value::as_str))
    else {
        return error_envelope(
            "invalid_args",
            "load_skill requires a string `skill_id`",
            json!({ "args": call.args_json }),
        );
    };

    match ctx.skills.load(skill_id) {
        Ok(loaded) => ok_envelope(json!(loaded)),
        Err(err) => error_envelope("invalid_args", err.to_string(), json!({ "skill_id": skill_id })),
    }
}

pub(crate) fn ok_envelope(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

pub(crate) fn error_envelope(code: &str, message: impl Into<String>, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message.into(),
            "details": details,
        }
    })
}
