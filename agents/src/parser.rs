use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::fs;
use std::path::Path;

use crate::builder::AgentBuilder;
use crate::error::ParserError;
use crate::error::ValidationError;
use crate::spec::AgentExample;
use crate::spec::AgentSource;
use crate::spec::AgentSpec;
use crate::spec::ModelProvider;
use crate::spec::ToolSpec;

const FRONT_MATTER_DELIM: &str = "---";

/// The raw shape of an agent file's front-matter. Everything is optional at
/// this layer; required-field and range enforcement happens in the builder.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FrontMatter {
    name: Option<String>,
    description: Option<String>,
    keywords: Option<Vec<String>>,
    priority: Option<u32>,
    tools: Option<Vec<FrontMatterTool>>,
    model: Option<String>,
    provider: Option<String>,
    examples: Option<Vec<FrontMatterExample>>,
    #[serde(alias = "systemPrompt")]
    system_prompt: Option<String>,
    temperature: Option<f32>,
    #[serde(alias = "maxTokens")]
    max_tokens: Option<u32>,
}

/// Tools accept either a bare name or a qualified record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FrontMatterTool {
    Name(String),
    Qualified {
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        parameters: Option<JsonValue>,
    },
}

impl From<FrontMatterTool> for ToolSpec {
    fn from(tool: FrontMatterTool) -> Self {
        match tool {
            FrontMatterTool::Name(name) => ToolSpec::named(name),
            FrontMatterTool::Qualified {
                name,
                description,
                parameters,
            } => ToolSpec {
                name,
                description,
                parameters,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct FrontMatterExample {
    input: String,
    output: String,
    #[serde(default)]
    description: Option<String>,
}

impl From<FrontMatterExample> for AgentExample {
    fn from(example: FrontMatterExample) -> Self {
        AgentExample {
            input: example.input,
            output: example.output,
            description: example.description,
        }
    }
}

pub fn parse_agent_file(path: &Path, source: AgentSource) -> Result<AgentSpec, ParserError> {
    let contents = fs::read_to_string(path)?;
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    parse_agent_str(&contents, path, source, modified)
}

pub fn parse_agent_str(
    contents: &str,
    path: &Path,
    source: AgentSource,
    modified: Option<DateTime<Utc>>,
) -> Result<AgentSpec, ParserError> {
    let (front_matter_raw, body) = split_front_matter(contents)?;

    // Two-stage deserialization keeps YAML syntax errors distinct from
    // shape mismatches against the agent schema.
    let value: YamlValue =
        serde_yaml::from_str(front_matter_raw).map_err(ParserError::InvalidYaml)?;
    if !matches!(value, YamlValue::Mapping(_)) {
        return Err(ParserError::NotAMapping);
    }
    let front_matter: FrontMatter =
        serde_yaml::from_value(value).map_err(ParserError::Schema)?;

    let name = front_matter
        .name
        .ok_or(ValidationError::MissingField("name"))?;
    let provider = front_matter
        .provider
        .ok_or(ValidationError::MissingField("provider"))?
        .parse::<ModelProvider>()?;

    let mut builder = AgentBuilder::new(name)
        .description(front_matter.description.unwrap_or_default())
        .keywords(front_matter.keywords.unwrap_or_default())
        .priority(front_matter.priority)
        .model(front_matter.model.unwrap_or_default())
        .provider(provider)
        .examples(
            front_matter
                .examples
                .unwrap_or_default()
                .into_iter()
                .map(AgentExample::from),
        )
        .temperature(front_matter.temperature)
        .max_tokens(front_matter.max_tokens)
        .source(source)
        .file_path(path)
        .last_modified(modified)
        .content(contents);

    if let Some(tools) = front_matter.tools {
        builder = builder.tools(tools.into_iter().map(ToolSpec::from));
    }

    // The body after the closing delimiter becomes the system prompt when
    // the field is not set explicitly.
    let system_prompt = front_matter
        .system_prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .or_else(|| {
            let body = body.trim();
            if body.is_empty() {
                None
            } else {
                Some(body.to_string())
            }
        });
    builder = builder.system_prompt(system_prompt);

    Ok(builder.build()?)
}

/// Split a document into its front-matter and body. Tolerates a UTF-8 BOM
/// and both LF and CRLF line endings.
fn split_front_matter(contents: &str) -> Result<(&str, &str), ParserError> {
    let trimmed = contents.trim_start_matches('\u{feff}');

    if !trimmed.starts_with(FRONT_MATTER_DELIM) {
        return Err(ParserError::MissingFrontMatter);
    }

    let mut rest = &trimmed[FRONT_MATTER_DELIM.len()..];
    rest = rest.strip_prefix('\r').unwrap_or(rest);
    rest = rest
        .strip_prefix('\n')
        .ok_or(ParserError::MissingFrontMatter)?;

    if let Some(idx) = rest.find("\n---") {
        let front_matter = &rest[..idx];
        let mut body = &rest[idx + 4..];
        if let Some(stripped) = body.strip_prefix('\r') {
            body = stripped;
        }
        if let Some(stripped) = body.strip_prefix('\n') {
            body = stripped;
        }
        Ok((front_matter.trim(), body))
    } else if let Some(front_matter) = rest
        .strip_suffix("\n---")
        .or_else(|| rest.strip_suffix("---"))
    {
        Ok((front_matter.trim(), ""))
    } else {
        Err(ParserError::UnterminatedFrontMatter)
    }
}
