use std::fs;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;
use tracing::warn;

use crate::error::LoadError;
use crate::parser::parse_agent_file;
use crate::spec::AgentSource;
use crate::spec::AgentSpec;

/// Options controlling where agent definitions are discovered.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Include the user-global agent directory in the scan.
    pub include_global: bool,
    /// Explicit user-global directory; defaults to `<home>/.pk/agents`.
    pub global_dir: Option<PathBuf>,
    /// Additional directories scanned as project-level definitions.
    pub extra_paths: Vec<PathBuf>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            include_global: true,
            global_dir: None,
            extra_paths: Vec::new(),
        }
    }
}

/// The outcome of a full scan. Bad files never fail the batch; they are
/// reported alongside the agents that did load.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub agents: Vec<AgentSpec>,
    pub errors: Vec<LoadError>,
    pub files_processed: usize,
}

/// Discovers and parses agent definition files.
#[derive(Debug, Clone)]
pub struct AgentLoader {
    project_root: PathBuf,
    options: LoaderOptions,
}

impl AgentLoader {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self::with_options(project_root, LoaderOptions::default())
    }

    pub fn with_options(project_root: impl Into<PathBuf>, options: LoaderOptions) -> Self {
        Self {
            project_root: project_root.into(),
            options,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Directories scanned, in deterministic search order: project, then
    /// user-global (when enabled), then any configured extra paths.
    pub fn agent_dirs(&self) -> Vec<(PathBuf, AgentSource)> {
        let mut dirs = vec![(
            self.project_root.join(".pk").join("agents"),
            AgentSource::Project,
        )];
        if self.options.include_global {
            let global = self
                .options
                .global_dir
                .clone()
                .or_else(|| dirs::home_dir().map(|home| home.join(".pk").join("agents")));
            if let Some(global) = global {
                dirs.push((global, AgentSource::Global));
            }
        }
        for extra in &self.options.extra_paths {
            dirs.push((extra.clone(), AgentSource::Project));
        }
        dirs
    }

    /// Scan every configured directory and resolve name collisions:
    /// a project definition always shadows a global one; otherwise the
    /// first file encountered in search order wins.
    pub fn load_agents(&self) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();
        let mut loaded: Vec<AgentSpec> = Vec::new();

        for (dir, source) in self.agent_dirs() {
            let scanned = self.load_directory(&dir, source, &mut outcome.errors);
            outcome.files_processed += scanned.len();
            loaded.extend(scanned.into_iter().flatten());
        }

        for spec in loaded {
            match outcome.agents.iter().position(|a| a.name == spec.name) {
                None => outcome.agents.push(spec),
                Some(idx) => {
                    let existing = &outcome.agents[idx];
                    if existing.source == AgentSource::Global
                        && spec.source == AgentSource::Project
                    {
                        debug!(
                            agent = %spec.name,
                            "project definition shadows global definition"
                        );
                        outcome.agents[idx] = spec;
                    } else {
                        debug!(agent = %spec.name, "dropping shadowed duplicate");
                    }
                }
            }
        }

        outcome
    }

    /// Scan one directory. Returns one slot per agent file processed so the
    /// caller can count files even when individual loads fail.
    pub fn load_directory(
        &self,
        dir: &Path,
        source: AgentSource,
        errors: &mut Vec<LoadError>,
    ) -> Vec<Option<AgentSpec>> {
        let mut results = Vec::new();
        for path in agent_files_in(dir) {
            match self.load_agent_file(&path, source) {
                Ok(spec) => {
                    debug!(agent = %spec.name, path = %path.display(), "loaded agent");
                    results.push(Some(spec));
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to load agent file");
                    errors.push(err);
                    results.push(None);
                }
            }
        }
        results
    }

    pub fn load_agent_file(
        &self,
        path: &Path,
        source: AgentSource,
    ) -> Result<AgentSpec, LoadError> {
        parse_agent_file(path, source)
            .map_err(|err| LoadError::from_parser(path.to_path_buf(), err))
    }
}

/// Agent files currently present in a directory, sorted by file name so
/// scans are deterministic. A missing directory yields an empty set.
pub fn agent_files_in(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_agent_file(path))
        .collect();
    files.sort();
    files
}

pub fn is_agent_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext, "md" | "markdown"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadErrorKind;
    use pretty_assertions::assert_eq;
    use std::fs::write;
    use tempfile::TempDir;

    fn agent_doc(name: &str, description: &str) -> String {
        format!(
            r#"---
name: {name}
description: {description}
keywords: [test]
model: gemini-2.0-flash
provider: gemini
examples:
  - input: hello
    output: world
---
Prompt body.
"#
        )
    }

    fn project_agents_dir(root: &Path) -> PathBuf {
        let dir = root.join(".pk").join("agents");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn loader_without_global(root: &Path) -> AgentLoader {
        AgentLoader::with_options(
            root,
            LoaderOptions {
                include_global: false,
                ..LoaderOptions::default()
            },
        )
    }

    #[test]
    fn loads_project_agents() {
        let temp = TempDir::new().unwrap();
        let dir = project_agents_dir(temp.path());
        write(dir.join("alpha.md"), agent_doc("alpha", "An alpha testing agent")).unwrap();
        write(dir.join("beta.markdown"), agent_doc("beta", "A beta testing agent")).unwrap();
        write(dir.join("notes.txt"), "ignored").unwrap();

        let outcome = loader_without_global(temp.path()).load_agents();
        assert_eq!(outcome.files_processed, 2);
        assert_eq!(outcome.errors.len(), 0);
        let mut names: Vec<&str> = outcome.agents.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(outcome.agents.iter().all(|a| a.source == AgentSource::Project));
    }

    #[test]
    fn aggregates_errors_without_failing_the_batch() {
        let temp = TempDir::new().unwrap();
        let dir = project_agents_dir(temp.path());
        write(dir.join("good.md"), agent_doc("good", "A well formed agent file")).unwrap();
        write(dir.join("bad.md"), "no front matter here").unwrap();

        let outcome = loader_without_global(temp.path()).load_agents();
        assert_eq!(outcome.files_processed, 2);
        assert_eq!(outcome.agents.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].kind, LoadErrorKind::Parse);
    }

    #[test]
    fn extra_paths_are_scanned_as_project_source() {
        let temp = TempDir::new().unwrap();
        project_agents_dir(temp.path());
        let extra = temp.path().join("shared-agents");
        fs::create_dir_all(&extra).unwrap();
        write(extra.join("shared.md"), agent_doc("shared", "A shared team agent")).unwrap();

        let loader = AgentLoader::with_options(
            temp.path(),
            LoaderOptions {
                include_global: false,
                extra_paths: vec![extra],
                ..LoaderOptions::default()
            },
        );
        let outcome = loader.load_agents();
        assert_eq!(outcome.agents.len(), 1);
        assert_eq!(outcome.agents[0].source, AgentSource::Project);
    }

    #[test]
    fn first_encountered_wins_between_same_source_duplicates() {
        let temp = TempDir::new().unwrap();
        let dir = project_agents_dir(temp.path());
        write(dir.join("a.md"), agent_doc("dup", "The first duplicate found")).unwrap();
        write(dir.join("b.md"), agent_doc("dup", "The second duplicate found")).unwrap();

        let outcome = loader_without_global(temp.path()).load_agents();
        assert_eq!(outcome.agents.len(), 1);
        assert_eq!(outcome.agents[0].description, "The first duplicate found");
    }

    #[test]
    fn project_definition_shadows_global() {
        let temp = TempDir::new().unwrap();
        let project = project_agents_dir(temp.path());
        let global = temp.path().join("home-agents");
        fs::create_dir_all(&global).unwrap();
        write(project.join("dup.md"), agent_doc("dup", "The project level definition")).unwrap();
        write(global.join("dup.md"), agent_doc("dup", "The global level definition")).unwrap();

        let loader = AgentLoader::with_options(
            temp.path(),
            LoaderOptions {
                include_global: true,
                global_dir: Some(global),
                extra_paths: Vec::new(),
            },
        );
        let outcome = loader.load_agents();
        assert_eq!(outcome.agents.len(), 1);
        assert_eq!(outcome.agents[0].source, AgentSource::Project);
        assert_eq!(outcome.agents[0].description, "The project level definition");
    }

    #[test]
    fn missing_directories_yield_empty_outcome() {
        let temp = TempDir::new().unwrap();
        let outcome = loader_without_global(temp.path()).load_agents();
        assert_eq!(outcome.files_processed, 0);
        assert!(outcome.agents.is_empty());
        assert!(outcome.errors.is_empty());
    }
}
