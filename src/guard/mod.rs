//! Admission gate in front of `execute_python`.
//!
//! A call is refused when the question is a plain data lookup, when it does
//! not declare the skills its code relies on, or when a declared skill was
//! never successfully loaded earlier in the conversation. Refusals go back to
//! the model as the tool result, correlated with the refused call, so it can
//! correct course.

mod history;
mod policy;

use std::future::Future;

use serde_json::{Value, json};
use tracing::info;

use crate::agent::dispatch::{
    EXECUTE_PYTHON_TOOL, FunctionCallSpec, LOAD_SKILL_TOOL, SEARCH_SKILLS_TOOL,
};
use crate::agent::lookup::LOOKUP_TOOLS;
use crate::llm::provider::AssistantMessage;

pub use history::{latest_user_text, loaded_skills};
pub use policy::{COMPUTATION_TERMS, ClassifierRule, LOOKUP_TERMS, QueryClass, QueryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionKind {
    SimpleLookup,
    MissingSkills,
    UnloadedSkills {
        missing: Vec<String>,
        not_found: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRejection {
    pub kind: RejectionKind,
    pub content: String,
    pub correlates_to: Option<String>,
}

impl GuardRejection {
    fn new(kind: RejectionKind, call: &FunctionCallSpec) -> Self {
        let content = match &kind {
            RejectionKind::SimpleLookup => {
                let lookups = LOOKUP_TOOLS
                    .iter()
                    .map(|tool| tool.name)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Refused: this question is a simple data lookup. Answer it with a lookup tool \
                     ({lookups}), not with {EXECUTE_PYTHON_TOOL}. Use {EXECUTE_PYTHON_TOOL} only for \
                     calculations, backtests, indicators or statistics."
                )
            }
            RejectionKind::MissingSkills => format!(
                "Refused: {EXECUTE_PYTHON_TOOL} requires `skills_used`. Call {SEARCH_SKILLS_TOOL}, \
                 then {LOAD_SKILL_TOOL} for the 1-3 most relevant skills, and retry with their names \
                 in `skills_used`."
            ),
            RejectionKind::UnloadedSkills { missing, not_found } => {
                let mut content = String::from("Refused: declared skills were not loaded successfully.");
                if !missing.is_empty() {
                    content.push_str(&format!(
                        " Not loaded in this conversation: {}.",
                        missing.join(", ")
                    ));
                }
                if !not_found.is_empty() {
                    content.push_str(&format!(" Not found: {}.", not_found.join(", ")));
                }
                content.push_str(&format!(
                    " Call {LOAD_SKILL_TOOL} for each of them (or search for the right name) and retry."
                ));
                content
            }
        };

        Self {
            kind,
            content,
            correlates_to: call.id.clone(),
        }
    }

    pub fn to_response_json(&self) -> Value {
        json!({
            "content": self.content,
            "correlates_to": self.correlates_to,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Admit,
    Reject(GuardRejection),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PythonGuard {
    policy: QueryPolicy,
    enabled: bool,
}

impl Default for PythonGuard {
    fn default() -> Self {
        Self::new(QueryPolicy::default(), true)
    }
}

impl PythonGuard {
    pub fn new(policy: QueryPolicy, enabled: bool) -> Self {
        Self { policy, enabled }
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Checks run in a fixed order and the first failure decides the
    /// rejection. Calls to other tools are always admitted.
    pub fn decide(&self, history: &[AssistantMessage], call: &FunctionCallSpec) -> GuardDecision {
        if !self.enabled || call.name != EXECUTE_PYTHON_TOOL {
            return GuardDecision::Admit;
        }

        if self.policy.is_simple_lookup(&latest_user_text(history)) {
            return GuardDecision::Reject(GuardRejection::new(RejectionKind::SimpleLookup, call));
        }

        let declared = declared_skills(&call.args_json);
        if declared.is_empty() {
            return GuardDecision::Reject(GuardRejection::new(RejectionKind::MissingSkills, call));
        }

        let loaded = loaded_skills(history);
        let missing = declared
            .iter()
            .filter(|skill| !loaded.contains_key(*skill))
            .cloned()
            .collect::<Vec<_>>();
        let not_found = declared
            .iter()
            .filter(|skill| loaded.get(*skill) == Some(&false))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() || !not_found.is_empty() {
            return GuardDecision::Reject(GuardRejection::new(
                RejectionKind::UnloadedSkills { missing, not_found },
                call,
            ));
        }

        GuardDecision::Admit
    }

    pub fn wrap_tool_call<F>(
        &self,
        history: &[AssistantMessage],
        call: &FunctionCallSpec,
        handler: F,
    ) -> Value
    where
        F: FnOnce(&FunctionCallSpec) -> Value,
    {
        match self.decide(history, call) {
            GuardDecision::Admit => handler(call),
            GuardDecision::Reject(rejection) => reject(call, rejection),
        }
    }

    pub async fn wrap_tool_call_async<F, Fut>(
        &self,
        history: &[AssistantMessage],
        call: &FunctionCallSpec,
        handler: F,
    ) -> Value
    where
        F: FnOnce(FunctionCallSpec) -> Fut,
        Fut: Future<Output = Value>,
    {
        match self.decide(history, call) {
            GuardDecision::Admit => handler(call.clone()).await,
            GuardDecision::Reject(rejection) => reject(call, rejection),
        }
    }
}

fn reject(call: &FunctionCallSpec, rejection: GuardRejection) -> Value {
    info!(
        tool = %call.name,
        call_id = ?call.id,
        kind = ?rejection.kind,
        "guard refused tool call"
    );
    rejection.to_response_json()
}

/// Whether a tool response is a guard refusal rather than a tool result.
pub fn is_rejection(response: &Value) -> bool {
    response.as_object().is_some_and(|fields| {
        fields.len() == 2 && fields.contains_key("content") && fields.contains_key("correlates_to")
    })
}

/// Declared skill names; anything other than an array of strings counts as
/// no declaration.
pub fn declared_skills(args: &Value) -> Vec<String> {
    args.get("skills_used")
        .and_then(Value::as_array)
        .map(|skills| {
            skills
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|skill| !skill.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
