use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ValidationError;

/// Where an agent definition came from. Project definitions shadow global
/// ones with the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentSource {
    Project,
    Global,
}

impl AgentSource {
    pub fn describe(self) -> &'static str {
        match self {
            AgentSource::Project => "project",
            AgentSource::Global => "global",
        }
    }
}

/// The closed set of model-endpoint providers an agent may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Gemini,
    OpenAi,
    Anthropic,
    Ollama,
}

impl ModelProvider {
    pub fn describe(self) -> &'static str {
        match self {
            ModelProvider::Gemini => "gemini",
            ModelProvider::OpenAi => "openai",
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::Ollama => "ollama",
        }
    }
}

impl FromStr for ModelProvider {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ModelProvider::Gemini),
            "openai" => Ok(ModelProvider::OpenAi),
            "anthropic" => Ok(ModelProvider::Anthropic),
            "ollama" => Ok(ModelProvider::Ollama),
            other => Err(ValidationError::UnknownProvider(other.to_string())),
        }
    }
}

/// A tool referenced by name in an agent definition. The core never executes
/// tools; the name is the contract with the hosting CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<JsonValue>,
}

impl ToolSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: None,
        }
    }
}

/// A single input/output example demonstrating the agent's behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExample {
    pub input: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A validated agent definition. Immutable once registered; the registry
/// hands out shared read-only handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    pub model: String,
    pub provider: ModelProvider,
    pub examples: Vec<AgentExample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub source: AgentSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    pub content: String,
    pub hash: String,
}

impl AgentSpec {
    pub fn source_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Effective priority for ordering; agents without one sort last.
    pub fn effective_priority(&self) -> u32 {
        self.priority.unwrap_or(u32::MAX)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Case-insensitive keyword membership test.
    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| k.eq_ignore_ascii_case(keyword))
    }

    /// All free text an agent exposes for matching: name, description, and
    /// keywords, lowercased.
    pub fn searchable_text(&self) -> String {
        let mut text = String::with_capacity(
            self.name.len() + self.description.len() + self.keywords.len() * 8,
        );
        text.push_str(&self.name.to_lowercase());
        text.push(' ');
        text.push_str(&self.description.to_lowercase());
        for keyword in &self.keywords {
            text.push(' ');
            text.push_str(&keyword.to_lowercase());
        }
        text
    }
}
