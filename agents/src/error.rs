use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid agent name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("description must be 10-500 characters, got {0}")]
    DescriptionLength(usize),
    #[error("keywords must contain at least one entry")]
    NoKeywords,
    #[error("keywords must be non-empty strings")]
    EmptyKeyword,
    #[error("duplicate keyword entry `{0}`")]
    DuplicateKeyword(String),
    #[error("at most 50 tools are allowed, got {0}")]
    TooManyTools(usize),
    #[error("tool names must be non-empty strings")]
    EmptyTool,
    #[error("duplicate tool entry `{0}`")]
    DuplicateTool(String),
    #[error("examples must contain at least one entry")]
    NoExamples,
    #[error("example input and output must be non-empty")]
    EmptyExample,
    #[error("temperature must be within [0, 2], got {0}")]
    TemperatureOutOfRange(f32),
    #[error("max_tokens must be within [1, 32768], got {0}")]
    MaxTokensOutOfRange(u32),
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
    #[error("model must be a non-empty string")]
    EmptyModel,
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("no front-matter block found")]
    MissingFrontMatter,
    #[error("front-matter block is not terminated")]
    UnterminatedFrontMatter,
    #[error("failed to parse front-matter: {0}")]
    InvalidYaml(serde_yaml::Error),
    #[error("front-matter did not deserialize to the agent schema: {0}")]
    Schema(serde_yaml::Error),
    #[error("front-matter must be a key/value mapping")]
    NotAMapping,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// The error category a single bad agent file falls into. Loading never
/// aborts the batch; each failure is reported with one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorKind {
    Parse,
    Validation,
    Schema,
    File,
}

impl LoadErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoadErrorKind::Parse => "parse-error",
            LoadErrorKind::Validation => "validation-error",
            LoadErrorKind::Schema => "schema-error",
            LoadErrorKind::File => "file-error",
        }
    }
}

/// A single agent file that could not be loaded.
#[derive(Debug, Clone, Error)]
#[error("{} [{}]: {message}", path.display(), kind.as_str())]
pub struct LoadError {
    pub path: PathBuf,
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(path: PathBuf, kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            message: message.into(),
        }
    }

    pub fn from_parser(path: PathBuf, err: ParserError) -> Self {
        let kind = match &err {
            ParserError::Io(_) => LoadErrorKind::File,
            ParserError::Schema(_) | ParserError::NotAMapping => LoadErrorKind::Schema,
            ParserError::Validation(_) => LoadErrorKind::Validation,
            ParserError::MissingFrontMatter
            | ParserError::UnterminatedFrontMatter
            | ParserError::InvalidYaml(_) => LoadErrorKind::Parse,
        };
        Self::new(path, kind, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown agent `{0}`")]
    UnknownAgent(String),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

pub type AgentResult<T> = Result<T, RegistryError>;
