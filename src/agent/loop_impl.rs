use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::agent::dispatch::{FunctionCallSpec, ToolContext, dispatch_calls, tool_declarations};
use crate::agent::prompt::AGENT_SYSTEM_PROMPT;
use crate::guard::is_rejection;
use crate::llm::provider::{
    AssistantCandidate, AssistantInput, AssistantMessage, AssistantPart, AssistantRole,
    LlmProvider, ToolCallingMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub per_step_timeout_ms: u64,
    pub total_timeout_ms: u64,
    pub invalid_response_retries: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            per_step_timeout_ms: 45_000,
            total_timeout_ms: 240_000,
            invalid_response_retries: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentAnswer {
    pub text: String,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentProgressEvent {
    StepStarted {
        step: usize,
    },
    ModelResponse {
        step: usize,
        thought_signatures: usize,
        tool_calls: usize,
        has_text: bool,
    },
    ToolRequest {
        step: usize,
        id: Option<String>,
        name: String,
        args_json: Value,
    },
    ToolResult {
        step: usize,
        id: Option<String>,
        name: String,
        response_json: Value,
        refused: bool,
    },
}

/// Answers one question within an ongoing conversation.
///
/// On a clean answer the whole exchange, tool calls included, is appended to
/// `conversation` so later questions see earlier skill loads. A degraded
/// answer only records the question and the fallback text.
pub async fn run_question_with_events<P: LlmProvider, F: FnMut(AgentProgressEvent)>(
    provider: &P,
    tools: &ToolContext,
    conversation: &mut Vec<AssistantMessage>,
    question: &str,
    config: &AgentConfig,
    on_event: &mut F,
) -> Result<AgentAnswer> {
    let mut messages = conversation.clone();
    messages.push(AssistantMessage::user_text(question));

    let answer = run_steps(provider, tools, &mut messages, config, on_event).await?;
    if answer.degraded {
        warn!(session = %tools.session_id, reason = %answer.text, "agent answer degraded");
        conversation.push(AssistantMessage::user_text(question));
        conversation.push(model_text(&answer.text));
    } else {
        *conversation = messages;
    }
    Ok(answer)
}

async fn run_steps<P: LlmProvider, F: FnMut(AgentProgressEvent)>(
    provider: &P,
    tools: &ToolContext,
    messages: &mut Vec<AssistantMessage>,
    config: &AgentConfig,
    on_event: &mut F,
) -> Result<AgentAnswer> {
    let declarations = tool_declarations();
    let total_deadline = Instant::now() + Duration::from_millis(config.total_timeout_ms);
    let mut invalid_response_attempts = 0usize;

    for step in 1..=config.max_steps {
        on_event(AgentProgressEvent::StepStarted { step });

        let Some(budget) = step_budget(total_deadline, config.per_step_timeout_ms) else {
            return Ok(degraded(
                "Assistant hit the total time limit while working on your question.",
            ));
        };

        let llm = timeout(
            budget,
            provider.generate(AssistantInput {
                system_instruction: Some(AGENT_SYSTEM_PROMPT.to_string()),
                messages: messages.clone(),
                tools: declarations.clone(),
                tool_calling_mode: ToolCallingMode::Auto,
            }),
        )
        .await;

        let output = match llm {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Ok(degraded(format!(
                    "Assistant request failed while working on your question: {err}"
                )));
            }
            Err(_) => {
                return Ok(degraded(
                    "Assistant hit a per-step timeout while working on your question.",
                ));
            }
        };

        let Some(candidate) = select_candidate(&output.candidates) else {
            if invalid_response_attempts >= config.invalid_response_retries {
                return Ok(degraded(
                    "Assistant returned an invalid response repeatedly and could not complete the tool flow.",
                ));
            }
            invalid_response_attempts += 1;
            messages.push(repair_prompt_message());
            continue;
        };

        let calls = extract_function_calls(&candidate.message.parts);
        let text = extract_text(&candidate.message.parts);
        on_event(AgentProgressEvent::ModelResponse {
            step,
            thought_signatures: count_thought_signatures(&candidate.message.parts),
            tool_calls: calls.len(),
            has_text: !text.is_empty(),
        });

        messages.push(candidate.message.clone());

        if calls.is_empty() {
            if !text.is_empty() {
                return Ok(AgentAnswer {
                    text,
                    degraded: false,
                });
            }

            if invalid_response_attempts >= config.invalid_response_retries {
                return Ok(degraded(
                    "Assistant returned an empty response repeatedly and could not complete the tool flow.",
                ));
            }
            invalid_response_attempts += 1;
            messages.push(repair_prompt_message());
            continue;
        }

        for call in &calls {
            debug!(step, tool = %call.name, call_id = ?call.id, "tool requested");
            on_event(AgentProgressEvent::ToolRequest {
                step,
                id: call.id.clone(),
                name: call.name.clone(),
                args_json: call.args_json.clone(),
            });
        }

        let responses = dispatch_calls(tools, messages, &calls).await;
        for response in &responses {
            if let AssistantPart::FunctionResponse {
                id,
                name,
                response_json,
                ..
            } = response
            {
                on_event(AgentProgressEvent::ToolResult {
                    step,
                    id: id.clone(),
                    name: name.clone(),
                    response_json: response_json.clone(),
                    refused: is_rejection(response_json),
                });
            }
        }
        messages.push(AssistantMessage {
            role: AssistantRole::User,
            parts: responses,
        });
    }

    if let Some(budget) = step_budget(total_deadline, config.per_step_timeout_ms)
        && let Some(text) = finalize_without_tools(provider, messages, budget).await
    {
        return Ok(AgentAnswer {
            text,
            degraded: true,
        });
    }

    Ok(degraded(
        "Assistant reached the step limit while working on your question.",
    ))
}

/// Time left for the next model call, or `None` once the total budget is
/// spent.
fn step_budget(total_deadline: Instant, per_step_timeout_ms: u64) -> Option<Duration> {
    let remaining = total_deadline.checked_duration_since(Instant::now())?;
    let budget = Duration::from_millis(per_step_timeout_ms).min(remaining);
    (!budget.is_zero()).then_some(budget)
}

fn degraded(message: impl Into<String>) -> AgentAnswer {
    AgentAnswer {
        text: message.into(),
        degraded: true,
    }
}

fn model_text(text: &str) -> AssistantMessage {
    AssistantMessage {
        role: AssistantRole::Model,
        parts: vec![AssistantPart::Text {
            text: text.to_string(),
            thought_signature: None,
        }],
    }
}

fn repair_prompt_message() -> AssistantMessage {
    AssistantMessage::user_text(
        "Your previous response was invalid for this tool loop. Either call a declared function or provide a non-empty plain-text final answer.",
    )
}

fn select_candidate(candidates: &[AssistantCandidate]) -> Option<&AssistantCandidate> {
    candidates
        .iter()
        .find(|candidate| {
            is_usable_candidate(candidate)
                && !has_function_calls(&candidate.message.parts)
                && !extract_text(&candidate.message.parts).is_empty()
        })
        .or_else(|| {
            candidates.iter().find(|candidate| {
                is_usable_candidate(candidate) && has_function_calls(&candidate.message.parts)
            })
        })
        .or_else(|| candidates.iter().find(|candidate| is_usable_candidate(candidate)))
}

fn is_usable_candidate(candidate: &AssistantCandidate) -> bool {
    let blocked_reason = matches!(
        candidate.finish_reason.as_deref(),
        Some("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")
    );
    !candidate.safety_blocked && !blocked_reason && !candidate.message.parts.is_empty()
}

fn has_function_calls(parts: &[AssistantPart]) -> bool {
    parts
        .iter()
        .any(|part| matches!(part, AssistantPart::FunctionCall { .. }))
}

fn count_thought_signatures(parts: &[AssistantPart]) -> usize {
    parts
        .iter()
        .filter(|part| match part {
            AssistantPart::Text {
                thought_signature, ..
            }
            | AssistantPart::FunctionCall {
                thought_signature, ..
            }
            | AssistantPart::FunctionResponse {
                thought_signature, ..
            } => thought_signature.is_some(),
        })
        .count()
}

async fn finalize_without_tools<P: LlmProvider>(
    provider: &P,
    messages: &[AssistantMessage],
    budget: Duration,
) -> Option<String> {
    let output = timeout(
        budget,
        provider.generate(AssistantInput {
            system_instruction: Some(format!(
                "{AGENT_SYSTEM_PROMPT}\n\nThe tool loop is complete. Do not call functions. Give the best concise answer supported by the tool results so far, and say what could not be computed."
            )),
            messages: messages.to_vec(),
            tools: vec![],
            tool_calling_mode: ToolCallingMode::None,
        }),
    )
    .await
    .ok()?
    .ok()?;

    let candidate = select_candidate(&output.candidates)?;
    let text = extract_text(&candidate.message.parts);
    (!text.is_empty()).then_some(text)
}

fn extract_function_calls(parts: &[AssistantPart]) -> Vec<FunctionCallSpec> {
    parts
        .iter()
        .filter_map(|part| match part {
            AssistantPart::FunctionCall {
                id,
                name,
                args_json,
                ..
            } => Some(FunctionCallSpec {
                id: id.clone(),
                name: name.clone(),
                args_json: args_json.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn extract_text(parts: &[AssistantPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            AssistantPart::Text { text, .. } if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}
