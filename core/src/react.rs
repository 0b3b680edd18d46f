use once_cell::sync::Lazy;
use pk_agents::AgentSpec;
use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

use crate::error::ReactError;
use crate::model::Content;
use crate::model::ContentGenerator;
use crate::model::GenerateRequest;
use crate::model::GenerateResponse;
use crate::model::GenerationConfig;

/// What the agent decided to do this step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReactAction {
    Tool {
        name: String,
        #[serde(default)]
        parameters: JsonValue,
    },
    Response {
        content: String,
    },
    Clarification {
        question: String,
    },
    Error {
        message: String,
    },
}

/// One reasoning-and-acting step parsed from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactStep {
    pub thought: String,
    pub action: ReactAction,
}

/// An example interaction included in the outbound prompt.
#[derive(Debug, Clone)]
pub struct ReactExample {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct ReactOptions {
    /// Re-prompt attempts after a malformed reply.
    pub max_reprompts: u32,
    /// Tool names the caller is willing to execute.
    pub tools: Vec<String>,
    pub examples: Vec<ReactExample>,
}

impl Default for ReactOptions {
    fn default() -> Self {
        Self {
            max_reprompts: 2,
            tools: Vec::new(),
            examples: Vec::new(),
        }
    }
}

/// The fixed response contract sent ahead of every ReAct interaction.
const REACT_SYSTEM_MESSAGE: &str = "\
You are a reasoning agent. Always answer with exactly one JSON object and \
nothing else, shaped as:
{\"thought\": \"<your reasoning>\", \"action\": <action>}
where <action> is one of:
  {\"type\": \"tool\", \"name\": \"<tool name>\", \"parameters\": {...}}
  {\"type\": \"response\", \"content\": \"<final answer>\"}
  {\"type\": \"clarification\", \"question\": \"<question for the user>\"}
  {\"type\": \"error\", \"message\": \"<why you cannot proceed>\"}
Choose a tool only from the available tools listed below.";

/// Wraps a single-agent execution in the structured thought/action
/// convention: builds the outbound contract, parses the reply, and
/// re-prompts a bounded number of times when the reply does not conform.
pub struct ReactAdapter {
    generator: Arc<dyn ContentGenerator>,
}

impl ReactAdapter {
    pub fn new(generator: Arc<dyn ContentGenerator>) -> Self {
        Self { generator }
    }

    pub async fn run(
        &self,
        agent: &AgentSpec,
        query: &str,
        options: &ReactOptions,
    ) -> Result<ReactStep, ReactError> {
        let mut request = self.build_request(agent, query, options);
        let mut last_error = String::new();

        for attempt in 0..=options.max_reprompts {
            let response = self.generator.generate(request.clone()).await?;
            match parse_react_response(&response) {
                Ok(step) => {
                    debug!(agent = %agent.name, attempt, "parsed react step");
                    return Ok(step);
                }
                Err(reason) => {
                    warn!(agent = %agent.name, attempt, %reason, "malformed react reply");
                    last_error = reason;
                    request.contents.push(Content::user(compose_reprompt(
                        &response.text(),
                        &last_error,
                    )));
                }
            }
        }

        Ok(ReactStep {
            thought: String::new(),
            action: ReactAction::Error {
                message: format!(
                    "model output stayed malformed after {} re-prompt(s): {last_error}",
                    options.max_reprompts
                ),
            },
        })
    }

    fn build_request(
        &self,
        agent: &AgentSpec,
        query: &str,
        options: &ReactOptions,
    ) -> GenerateRequest {
        let mut prompt = String::from(REACT_SYSTEM_MESSAGE);

        for example in &options.examples {
            prompt.push_str("\n\nExample:\nUser: ");
            prompt.push_str(&example.input);
            prompt.push_str("\nReply: ");
            prompt.push_str(&example.output);
        }

        prompt.push_str("\n\nAvailable tools: ");
        if options.tools.is_empty() {
            prompt.push_str("(none)");
        } else {
            prompt.push_str(&options.tools.join(", "));
        }

        if let Some(system_prompt) = agent.system_prompt.as_deref() {
            prompt.push_str("\n\n");
            prompt.push_str(system_prompt);
        }
        prompt.push_str("\n\nUser Query: ");
        prompt.push_str(query);

        GenerateRequest {
            model: agent.model.clone(),
            contents: vec![Content::user(prompt)],
            config: GenerationConfig {
                temperature: agent.temperature,
                max_output_tokens: agent.max_tokens,
            },
        }
    }
}

fn compose_reprompt(received: &str, error: &str) -> String {
    format!(
        "Your previous reply could not be parsed: {error}\n\nYou replied:\n{received}\n\n\
         Answer again with exactly one JSON object in the required shape."
    )
}

#[derive(Debug, Deserialize)]
struct StepWire {
    thought: Option<String>,
    action: ActionWire,
}

#[derive(Debug, Deserialize)]
struct ActionWire {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    parameters: Option<JsonValue>,
    content: Option<String>,
    question: Option<String>,
    message: Option<String>,
}

/// Parse a model reply in strict order: native tool calls first, then the
/// structured JSON shape, then pattern extraction for free-form text.
pub fn parse_react_response(response: &GenerateResponse) -> Result<ReactStep, String> {
    if let Some(call) = response.function_calls().first() {
        let text = response.text();
        let thought = if text.trim().is_empty() {
            format!("Selecting tool: {}", call.name)
        } else {
            text.trim().to_string()
        };
        return Ok(ReactStep {
            thought,
            action: ReactAction::Tool {
                name: call.name.clone(),
                parameters: call.args.clone(),
            },
        });
    }

    let text = response.text();
    let cleaned = strip_code_fence(&text);
    if cleaned.trim_start().starts_with('{') {
        return parse_structured(cleaned.trim());
    }

    Ok(extract_from_text(&text))
}

fn parse_structured(text: &str) -> Result<ReactStep, String> {
    let wire: StepWire =
        serde_json::from_str(text).map_err(|err| format!("invalid JSON: {err}"))?;
    let thought = wire.thought.unwrap_or_default();
    let action = match wire.action.kind.as_str() {
        "tool" => ReactAction::Tool {
            name: wire
                .action
                .name
                .filter(|n| !n.trim().is_empty())
                .ok_or("tool action requires a name")?,
            parameters: wire.action.parameters.unwrap_or(JsonValue::Null),
        },
        "response" => ReactAction::Response {
            content: wire
                .action
                .content
                .ok_or("response action requires content")?,
        },
        "clarification" => ReactAction::Clarification {
            question: wire
                .action
                .question
                .ok_or("clarification action requires a question")?,
        },
        "error" => ReactAction::Error {
            message: wire
                .action
                .message
                .ok_or("error action requires a message")?,
        },
        other => return Err(format!("unknown action type `{other}`")),
    };
    Ok(ReactStep { thought, action })
}

static THOUGHT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)thought\s*:\s*(.+)").expect("compiled thought regex"));

static USING_TOOL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)using tool\s*:\s*([A-Za-z0-9_-]+)").expect("compiled using-tool regex")
});

/// Last-resort extraction for free-form replies.
fn extract_from_text(text: &str) -> ReactStep {
    let thought = THOUGHT_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();

    if let Some(caps) = USING_TOOL_RE.captures(text) {
        if let Some(name) = caps.get(1) {
            return ReactStep {
                thought,
                action: ReactAction::Tool {
                    name: name.as_str().to_string(),
                    parameters: JsonValue::Object(serde_json::Map::new()),
                },
            };
        }
    }

    let trimmed = text.trim();
    if trimmed.ends_with('?') {
        return ReactStep {
            thought,
            action: ReactAction::Clarification {
                question: trimmed.to_string(),
            },
        };
    }

    ReactStep {
        thought,
        action: ReactAction::Response {
            content: trimmed.to_string(),
        },
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return trimmed;
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Candidate;
    use crate::model::FunctionCall;
    use crate::model::Part;
    use pk_agents::AgentBuilder;
    use pk_agents::ModelProvider;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn agent() -> AgentSpec {
        AgentBuilder::new("react-agent")
            .description("An agent exercised by the react adapter tests")
            .keywords(["react-step"])
            .model("gemini-2.0-flash")
            .provider(ModelProvider::Gemini)
            .example("in", "out")
            .system_prompt(Some("Solve tasks with tools.".to_string()))
            .build()
            .unwrap()
    }

    struct ScriptedGenerator {
        replies: Mutex<VecDeque<GenerateResponse>>,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<GenerateResponse>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ContentGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            request: GenerateRequest,
        ) -> Result<GenerateResponse, crate::error::GeneratorError> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(crate::error::GeneratorError::EmptyResponse)
        }
    }

    fn function_call_response(name: &str, args: JsonValue) -> GenerateResponse {
        GenerateResponse {
            candidates: vec![Candidate {
                content: Content {
                    role: "model".to_string(),
                    parts: vec![Part::FunctionCall {
                        function_call: FunctionCall {
                            name: name.to_string(),
                            args,
                        },
                    }],
                },
            }],
            execution_time_ms: None,
        }
    }

    #[test]
    fn native_tool_calls_win() {
        let response = function_call_response("grep", json!({"pattern": "fn main"}));
        let step = parse_react_response(&response).unwrap();
        assert_eq!(step.thought, "Selecting tool: grep");
        assert_eq!(
            step.action,
            ReactAction::Tool {
                name: "grep".to_string(),
                parameters: json!({"pattern": "fn main"}),
            }
        );
    }

    #[test]
    fn structured_json_is_parsed() {
        let reply = r#"{"thought": "need the file", "action": {"type": "tool", "name": "read", "parameters": {"path": "a.rs"}}}"#;
        let step = parse_react_response(&GenerateResponse::from_text(reply)).unwrap();
        assert_eq!(step.thought, "need the file");
        assert!(matches!(step.action, ReactAction::Tool { ref name, .. } if name == "read"));
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let reply = "```json\n{\"thought\": \"done\", \"action\": {\"type\": \"response\", \"content\": \"all set\"}}\n```";
        let step = parse_react_response(&GenerateResponse::from_text(reply)).unwrap();
        assert_eq!(
            step.action,
            ReactAction::Response {
                content: "all set".to_string()
            }
        );
    }

    #[test]
    fn json_missing_required_field_is_rejected() {
        let reply = r#"{"thought": "hm", "action": {"type": "tool"}}"#;
        let err = parse_react_response(&GenerateResponse::from_text(reply)).unwrap_err();
        assert!(err.contains("requires a name"));
    }

    #[test]
    fn free_text_falls_back_to_patterns() {
        let reply = "Thought: I should search first\nUsing tool: web-search";
        let step = parse_react_response(&GenerateResponse::from_text(reply)).unwrap();
        assert_eq!(step.thought, "I should search first");
        assert!(matches!(step.action, ReactAction::Tool { ref name, .. } if name == "web-search"));
    }

    #[test]
    fn trailing_question_becomes_clarification() {
        let reply = "Which file did you mean?";
        let step = parse_react_response(&GenerateResponse::from_text(reply)).unwrap();
        assert!(matches!(step.action, ReactAction::Clarification { .. }));
    }

    #[test]
    fn plain_text_becomes_response() {
        let reply = "The function is already correct.";
        let step = parse_react_response(&GenerateResponse::from_text(reply)).unwrap();
        assert_eq!(
            step.action,
            ReactAction::Response {
                content: "The function is already correct.".to_string()
            }
        );
    }

    #[tokio::test]
    async fn reprompts_until_parseable() {
        let generator = ScriptedGenerator::new(vec![
            GenerateResponse::from_text(r#"{"action": {"type": "mystery"}}"#),
            GenerateResponse::from_text(
                r#"{"thought": "ok", "action": {"type": "response", "content": "fixed"}}"#,
            ),
        ]);
        let adapter = ReactAdapter::new(generator.clone());
        let step = adapter
            .run(&agent(), "do the thing", &ReactOptions::default())
            .await
            .unwrap();
        assert_eq!(
            step.action,
            ReactAction::Response {
                content: "fixed".to_string()
            }
        );

        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        // The re-prompt carries the rejected reply and the validation error.
        let reprompt = requests[1].contents.last().unwrap().parts[0]
            .as_text()
            .unwrap();
        assert!(reprompt.contains("mystery"));
        assert!(reprompt.contains("could not be parsed"));
    }

    #[tokio::test]
    async fn exhausted_reprompts_return_error_action() {
        let generator = ScriptedGenerator::new(vec![
            GenerateResponse::from_text(r#"{"action": {"type": "mystery"}}"#),
            GenerateResponse::from_text(r#"{"action": {"type": "mystery"}}"#),
            GenerateResponse::from_text(r#"{"action": {"type": "mystery"}}"#),
        ]);
        let adapter = ReactAdapter::new(generator);
        let step = adapter
            .run(&agent(), "do the thing", &ReactOptions::default())
            .await
            .unwrap();
        assert!(matches!(step.action, ReactAction::Error { .. }));
    }

    #[tokio::test]
    async fn prompt_lists_available_tools() {
        let generator = ScriptedGenerator::new(vec![GenerateResponse::from_text(
            r#"{"thought": "t", "action": {"type": "response", "content": "done"}}"#,
        )]);
        let adapter = ReactAdapter::new(generator.clone());
        let options = ReactOptions {
            tools: vec!["read".to_string(), "grep".to_string()],
            ..ReactOptions::default()
        };
        adapter.run(&agent(), "scan the repo", &options).await.unwrap();

        let requests = generator.requests.lock().unwrap();
        let prompt = requests[0].contents[0].parts[0].as_text().unwrap();
        assert!(prompt.contains("Available tools: read, grep"));
        assert!(prompt.contains("Solve tasks with tools."));
        assert!(prompt.contains("User Query: scan the repo"));
    }

    #[test]
    fn action_serializes_with_type_tag() {
        let action = ReactAction::Tool {
            name: "read".to_string(),
            parameters: json!({"path": "x"}),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "tool");
        assert_eq!(value["name"], "read");
    }
}
