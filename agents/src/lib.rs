//! Agent definition primitives for the pk orchestration core: the agent
//! file format, validating loader, in-memory registry, and filesystem
//! watcher that keeps the registry consistent with the agent directories.

mod builder;
mod error;
mod loader;
mod parser;
mod registry;
mod spec;
mod watcher;

pub use builder::AgentBuilder;
pub use builder::validate_agent_name;
pub use error::AgentResult;
pub use error::LoadError;
pub use error::LoadErrorKind;
pub use error::ParserError;
pub use error::RegistryError;
pub use error::ValidationError;
pub use loader::AgentLoader;
pub use loader::LoadOutcome;
pub use loader::LoaderOptions;
pub use parser::parse_agent_file;
pub use parser::parse_agent_str;
pub use registry::AgentIndex;
pub use registry::AgentRegistry;
pub use registry::ReloadReport;
pub use spec::AgentExample;
pub use spec::AgentSource;
pub use spec::AgentSpec;
pub use spec::ModelProvider;
pub use spec::ToolSpec;
