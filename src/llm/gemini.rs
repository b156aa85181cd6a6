use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::provider::{
    AssistantCandidate, AssistantInput, AssistantMessage, AssistantOutput, AssistantPart,
    AssistantRole, LlmError, LlmProvider, LlmResult, ToolCallingMode,
};

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(
        client: Client,
        api_key: Option<String>,
        model: String,
        base_url: String,
    ) -> LlmResult<Self> {
        let api_key = api_key
            .filter(|v| !v.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn build_request(input: &AssistantInput) -> GeminiGenerateRequest {
        let tools = if input.tools.is_empty() {
            vec![]
        } else {
            vec![GeminiTool {
                function_declarations: input
                    .tools
                    .iter()
                    .map(|tool| GeminiFunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters_json_schema: tool.parameters_json_schema.clone(),
                    })
                    .collect(),
            }]
        };
        let tool_config = (!tools.is_empty()).then(|| GeminiToolConfig {
            function_calling_config: GeminiFunctionCallingConfig {
                mode: match input.tool_calling_mode {
                    ToolCallingMode::Auto => "AUTO",
                    ToolCallingMode::None => "NONE",
                },
            },
        });

        GeminiGenerateRequest {
            contents: input.messages.iter().map(to_gemini_content).collect(),
            system_instruction: input.system_instruction.as_ref().map(|text| {
                GeminiSystemInstruction {
                    parts: vec![GeminiPart::text(text.clone())],
                }
            }),
            tools,
            tool_config,
        }
    }

    fn into_output(resp: GeminiGenerateResponse) -> LlmResult<AssistantOutput> {
        if resp.candidates.is_empty() {
            return Err(LlmError::EmptyResponse);
        }

        let candidates = resp
            .candidates
            .into_iter()
            .map(|candidate| {
                let safety_blocked = candidate.finish_reason.as_deref() == Some("SAFETY")
                    || candidate.safety_ratings.iter().any(|rating| rating.blocked);
                let parts = candidate
                    .content
                    .map(|content| content.parts)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(from_gemini_part)
                    .collect();
                AssistantCandidate {
                    message: AssistantMessage {
                        role: AssistantRole::Model,
                        parts,
                    },
                    finish_reason: candidate.finish_reason,
                    safety_blocked,
                }
            })
            .collect();

        Ok(AssistantOutput { candidates })
    }
}

impl LlmProvider for GeminiProvider {
    async fn generate(&self, input: AssistantInput) -> LlmResult<AssistantOutput> {
        let payload = Self::build_request(&input);
        debug!(
            model = %self.model,
            messages = payload.contents.len(),
            tools = input.tools.len(),
            "sending generateContent request"
        );
        let resp = self
            .client
            .post(self.endpoint())
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(&payload)
            .send()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            let body = body.chars().take(400).collect::<String>();
            return Err(LlmError::HttpStatus { status, body });
        }

        let parsed = resp
            .json::<GeminiGenerateResponse>()
            .await
            .map_err(|err| LlmError::Parse(err.to_string()))?;
        Self::into_output(parsed)
    }
}

fn to_gemini_content(message: &AssistantMessage) -> GeminiContent {
    GeminiContent {
        role: match message.role {
            AssistantRole::User => "user",
            AssistantRole::Model => "model",
        }
        .to_string(),
        parts: message.parts.iter().map(to_gemini_part).collect(),
    }
}

fn to_gemini_part(part: &AssistantPart) -> GeminiPart {
    match part {
        AssistantPart::Text {
            text,
            thought_signature,
        } => GeminiPart {
            thought_signature: thought_signature.clone(),
            ..GeminiPart::text(text.clone())
        },
        AssistantPart::FunctionCall {
            id,
            name,
            args_json,
            thought_signature,
        } => GeminiPart {
            function_call: Some(GeminiFunctionCall {
                id: id.clone(),
                name: name.clone(),
                args: args_json.clone(),
            }),
            thought_signature: thought_signature.clone(),
            ..GeminiPart::default()
        },
        AssistantPart::FunctionResponse {
            id,
            name,
            response_json,
            thought_signature,
        } => GeminiPart {
            function_response: Some(GeminiFunctionResponse {
                id: id.clone(),
                name: name.clone(),
                response: response_json.clone(),
            }),
            thought_signature: thought_signature.clone(),
            ..GeminiPart::default()
        },
    }
}

fn from_gemini_part(part: GeminiPart) -> Option<AssistantPart> {
    if let Some(call) = part.function_call {
        return Some(AssistantPart::FunctionCall {
            id: call.id,
            name: call.name,
            args_json: call.args,
            thought_signature: part.thought_signature,
        });
    }
    if let Some(response) = part.function_response {
        return Some(AssistantPart::FunctionResponse {
            id: response.id,
            name: response.name,
            response_json: response.response,
            thought_signature: part.thought_signature,
        });
    }
    // Thought summaries are not part of the answer.
    if part.thought == Some(true) {
        return None;
    }
    part.text.map(|text| AssistantPart::Text {
        text,
        thought_signature: part.thought_signature,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<GeminiToolConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<GeminiFunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(default, skip_serializing)]
    thought: Option<bool>,
}

impl GeminiPart {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters_json_schema: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiToolConfig {
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiResponseContent>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    safety_ratings: Vec<GeminiSafetyRating>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiSafetyRating {
    #[serde(default)]
    blocked: bool,
}
