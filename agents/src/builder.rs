use chrono::DateTime;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use sha1::Digest;
use sha1::Sha1;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::error::ValidationError;
use crate::spec::AgentExample;
use crate::spec::AgentSource;
use crate::spec::AgentSpec;
use crate::spec::ModelProvider;
use crate::spec::ToolSpec;

const MAX_NAME_LEN: usize = 100;
const MAX_TOOLS: usize = 50;
const MIN_DESCRIPTION_LEN: usize = 10;
const MAX_DESCRIPTION_LEN: usize = 500;

pub fn validate_agent_name(name: &str) -> Result<(), ValidationError> {
    static NAME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("compiled name regex"));
    if name.is_empty() || name.len() > MAX_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(ValidationError::InvalidName {
            name: name.to_string(),
            reason: format!(
                "name must contain only letters, digits, hyphen, or underscore, and be 1-{MAX_NAME_LEN} characters long"
            ),
        });
    }
    Ok(())
}

/// The single construction path for [`AgentSpec`]. Every field bound in the
/// agent schema is enforced here, whether the record comes from a file or
/// from embedding code.
#[derive(Debug, Default)]
pub struct AgentBuilder {
    name: Option<String>,
    description: Option<String>,
    keywords: Vec<String>,
    priority: Option<u32>,
    tools: Vec<ToolSpec>,
    model: Option<String>,
    provider: Option<ModelProvider>,
    examples: Vec<AgentExample>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    source: Option<AgentSource>,
    file_path: Option<PathBuf>,
    last_modified: Option<DateTime<Utc>>,
    content: Option<String>,
}

impl AgentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: impl Into<Option<u32>>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = ToolSpec>,
    {
        self.tools = tools.into_iter().collect();
        self
    }

    pub fn tool_names<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools(names.into_iter().map(|n| ToolSpec::named(n.into())))
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn provider(mut self, provider: ModelProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn example(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.examples.push(AgentExample {
            input: input.into(),
            output: output.into(),
            description: None,
        });
        self
    }

    pub fn examples<I>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = AgentExample>,
    {
        self.examples = examples.into_iter().collect();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<Option<String>>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn temperature(mut self, temperature: impl Into<Option<f32>>) -> Self {
        self.temperature = temperature.into();
        self
    }

    pub fn max_tokens(mut self, max_tokens: impl Into<Option<u32>>) -> Self {
        self.max_tokens = max_tokens.into();
        self
    }

    pub fn source(mut self, source: AgentSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn last_modified(mut self, modified: impl Into<Option<DateTime<Utc>>>) -> Self {
        self.last_modified = modified.into();
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn build(self) -> Result<AgentSpec, ValidationError> {
        let name = self.name.ok_or(ValidationError::MissingField("name"))?;
        validate_agent_name(&name)?;

        let description = self
            .description
            .ok_or(ValidationError::MissingField("description"))?;
        let description = description.trim().to_string();
        let description_chars = description.chars().count();
        if !(MIN_DESCRIPTION_LEN..=MAX_DESCRIPTION_LEN).contains(&description_chars) {
            return Err(ValidationError::DescriptionLength(description_chars));
        }

        let keywords = normalize_keywords(self.keywords)?;
        let tools = normalize_tools(self.tools)?;

        let model = self.model.ok_or(ValidationError::MissingField("model"))?;
        let model = model.trim().to_string();
        if model.is_empty() {
            return Err(ValidationError::EmptyModel);
        }

        let provider = self
            .provider
            .ok_or(ValidationError::MissingField("provider"))?;

        if self.examples.is_empty() {
            return Err(ValidationError::NoExamples);
        }
        for example in &self.examples {
            if example.input.trim().is_empty() || example.output.trim().is_empty() {
                return Err(ValidationError::EmptyExample);
            }
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ValidationError::TemperatureOutOfRange(temperature));
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            if !(1..=32_768).contains(&max_tokens) {
                return Err(ValidationError::MaxTokensOutOfRange(max_tokens));
            }
        }

        let system_prompt = self
            .system_prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let content = self.content.unwrap_or_default();
        let hash = identity_hash(
            &name,
            &model,
            provider,
            system_prompt.as_deref(),
            &tools,
            &keywords,
        );

        Ok(AgentSpec {
            name,
            description,
            keywords,
            priority: self.priority,
            tools,
            model,
            provider,
            examples: self.examples,
            system_prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            source: self.source.unwrap_or(AgentSource::Project),
            file_path: self.file_path,
            last_modified: self.last_modified,
            content,
            hash,
        })
    }
}

fn normalize_keywords(keywords: Vec<String>) -> Result<Vec<String>, ValidationError> {
    if keywords.is_empty() {
        return Err(ValidationError::NoKeywords);
    }
    let mut seen = BTreeSet::new();
    let mut output = Vec::with_capacity(keywords.len());
    for raw in keywords {
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyKeyword);
        }
        if !seen.insert(trimmed.to_lowercase()) {
            return Err(ValidationError::DuplicateKeyword(trimmed));
        }
        output.push(trimmed);
    }
    Ok(output)
}

fn normalize_tools(tools: Vec<ToolSpec>) -> Result<Vec<ToolSpec>, ValidationError> {
    if tools.len() > MAX_TOOLS {
        return Err(ValidationError::TooManyTools(tools.len()));
    }
    let mut seen = BTreeSet::new();
    let mut output = Vec::with_capacity(tools.len());
    for mut tool in tools {
        tool.name = tool.name.trim().to_string();
        if tool.name.is_empty() {
            return Err(ValidationError::EmptyTool);
        }
        if !seen.insert(tool.name.to_lowercase()) {
            return Err(ValidationError::DuplicateTool(tool.name));
        }
        output.push(tool);
    }
    Ok(output)
}

fn identity_hash(
    name: &str,
    model: &str,
    provider: ModelProvider,
    system_prompt: Option<&str>,
    tools: &[ToolSpec],
    keywords: &[String],
) -> String {
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(model.as_bytes());
    hasher.update(provider.describe().as_bytes());
    if let Some(prompt) = system_prompt {
        hasher.update(prompt.as_bytes());
    }
    for tool in tools {
        hasher.update(tool.name.as_bytes());
        if let Ok(serialized) = serde_json::to_vec(&tool.parameters) {
            hasher.update(&serialized);
        }
    }
    for keyword in keywords {
        hasher.update(keyword.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
