use async_trait::async_trait;
use pk_agents::AgentSpec;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::GeneratorError;

/// One part of a model turn. The wire shape mirrors the endpoint contract:
/// `{text}`, `{inlineData: {mimeType, data}}`, or `{functionCall: {name, args}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall { function_call } => Some(function_call),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub contents: Vec<Content>,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub candidates: Vec<Candidate>,
    /// Time the endpoint reports having spent generating, when it reports
    /// one at all. Used to split overhead out of observed durations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl GenerateResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            candidates: vec![Candidate {
                content: Content {
                    role: "model".to_string(),
                    parts: vec![Part::text(text)],
                },
            }],
            execution_time_ms: None,
        }
    }

    /// Concatenated text parts of the first candidate.
    pub fn text(&self) -> String {
        self.candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(Part::as_text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }

    /// Function-call parts of the first candidate, in order.
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.candidates
            .first()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .iter()
                    .filter_map(Part::as_function_call)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The model-endpoint collaborator. One call per agent execution; the
/// executor composes timeouts and cancellation around it.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, GeneratorError>;

    /// Endpoints with native cancellation override this; the default ignores
    /// the token and the executor races the call against it instead.
    async fn generate_with_cancel(
        &self,
        request: GenerateRequest,
        _cancel: CancellationToken,
    ) -> Result<GenerateResponse, GeneratorError> {
        self.generate(request).await
    }
}

/// Maps an agent to the generator that serves it.
pub type GeneratorFactory = Arc<dyn Fn(&AgentSpec) -> Arc<dyn ContentGenerator> + Send + Sync>;

/// Build the request an agent execution sends: a single user turn carrying
/// the agent's system prompt and the query, plus the agent's generation
/// settings.
pub fn build_agent_request(agent: &AgentSpec, query: &str) -> GenerateRequest {
    let text = match agent.system_prompt.as_deref() {
        Some(prompt) => format!("{prompt}\n\nUser Query: {query}"),
        None => format!("User Query: {query}"),
    };
    GenerateRequest {
        model: agent.model.clone(),
        contents: vec![Content::user(text)],
        config: GenerationConfig {
            temperature: agent.temperature,
            max_output_tokens: agent.max_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parts_serialize_to_the_wire_shape() {
        let text = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(text, json!({"text": "hi"}));

        let call = serde_json::to_value(Part::FunctionCall {
            function_call: FunctionCall {
                name: "grep".to_string(),
                args: json!({"pattern": "fn"}),
            },
        })
        .unwrap();
        assert_eq!(
            call,
            json!({"functionCall": {"name": "grep", "args": {"pattern": "fn"}}})
        );

        let data = serde_json::to_value(Part::InlineData {
            inline_data: InlineData {
                mime_type: "image/png".to_string(),
                data: "AAAA".to_string(),
            },
        })
        .unwrap();
        assert_eq!(
            data,
            json!({"inlineData": {"mimeType": "image/png", "data": "AAAA"}})
        );
    }

    #[test]
    fn response_text_concatenates_first_candidate() {
        let response = GenerateResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: "model".to_string(),
                    parts: vec![Part::text("hello "), Part::text("world")],
                },
            }],
            execution_time_ms: None,
        };
        assert_eq!(response.text(), "hello world");
    }

    #[test]
    fn build_agent_request_embeds_prompt_and_settings() {
        let agent = pk_agents::AgentBuilder::new("gen")
            .description("Generates code for request tests")
            .keywords(["code"])
            .model("gemini-2.0-flash")
            .provider(pk_agents::ModelProvider::Gemini)
            .example("in", "out")
            .system_prompt(Some("You write code.".to_string()))
            .temperature(0.2)
            .max_tokens(1024u32)
            .build()
            .unwrap();

        let request = build_agent_request(&agent, "add two numbers");
        assert_eq!(request.model, "gemini-2.0-flash");
        assert_eq!(request.contents.len(), 1);
        assert_eq!(
            request.contents[0].parts[0].as_text(),
            Some("You write code.\n\nUser Query: add two numbers")
        );
        assert_eq!(request.config.temperature, Some(0.2));
        assert_eq!(request.config.max_output_tokens, Some(1024));
    }
}
