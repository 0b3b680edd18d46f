use indexmap::IndexMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::LoadError;
use crate::error::RegistryError;
use crate::loader::AgentLoader;
use crate::loader::LoadOutcome;
use crate::loader::agent_files_in;
use crate::spec::AgentSource;
use crate::spec::AgentSpec;
use crate::watcher::DirectoryWatcher;

/// Summary of a full reload.
#[derive(Debug, Default, Clone)]
pub struct ReloadReport {
    pub loaded: usize,
    pub removed: usize,
    pub errors: usize,
}

/// The in-memory agent index. Insertion order is preserved so "first
/// registered" is a meaningful tie-break for callers; re-registering a name
/// overwrites in place.
#[derive(Debug, Default)]
pub struct AgentIndex {
    agents: IndexMap<String, Arc<AgentSpec>>,
}

impl AgentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: AgentSpec) -> Arc<AgentSpec> {
        let spec = Arc::new(spec);
        self.agents.insert(spec.name.clone(), spec.clone());
        spec
    }

    /// Register a spec found during a rescan. A global definition never
    /// displaces a project definition loaded from a different file.
    pub(crate) fn register_scanned(&mut self, spec: AgentSpec) -> Option<Arc<AgentSpec>> {
        if let Some(existing) = self.agents.get(&spec.name) {
            let shadowed = existing.source == AgentSource::Project
                && spec.source == AgentSource::Global
                && existing.file_path != spec.file_path;
            if shadowed {
                debug!(agent = %spec.name, "rescan kept project definition over global");
                return None;
            }
        }
        Some(self.register(spec))
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<AgentSpec>> {
        self.agents.shift_remove(name)
    }

    /// Remove every agent whose definition file lives under `dir`.
    pub(crate) fn unregister_under(&mut self, dir: &Path) -> Vec<String> {
        let names: Vec<String> = self
            .agents
            .values()
            .filter(|spec| {
                spec.file_path
                    .as_deref()
                    .is_some_and(|p| p.starts_with(dir))
            })
            .map(|spec| spec.name.clone())
            .collect();
        for name in &names {
            self.agents.shift_remove(name);
        }
        names
    }

    pub(crate) fn name_for_path(&self, path: &Path) -> Option<String> {
        self.agents
            .values()
            .find(|spec| spec.file_path.as_deref() == Some(path))
            .map(|spec| spec.name.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentSpec>> {
        self.agents.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<AgentSpec>> {
        self.agents.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Substring keyword match, either direction, case-insensitive: an agent
    /// matches when any queried keyword contains or is contained by one of
    /// its keywords.
    pub fn find(&self, keywords: &[&str]) -> Vec<Arc<AgentSpec>> {
        let queries: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        self.agents
            .values()
            .filter(|spec| {
                spec.keywords.iter().any(|own| {
                    let own = own.to_lowercase();
                    queries
                        .iter()
                        .any(|q| !q.is_empty() && (own.contains(q.as_str()) || q.contains(&own)))
                })
            })
            .cloned()
            .collect()
    }

    /// Exact keyword membership: an agent matches only when every queried
    /// keyword is one of its keywords (case-insensitive).
    pub fn find_by_exact_keywords(&self, keywords: &[&str]) -> Vec<Arc<AgentSpec>> {
        if keywords.is_empty() {
            return Vec::new();
        }
        self.agents
            .values()
            .filter(|spec| keywords.iter().all(|k| spec.has_keyword(k)))
            .cloned()
            .collect()
    }

    /// Free-text search over name, description, and keywords.
    pub fn search_text(&self, query: &str) -> Vec<Arc<AgentSpec>> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        self.agents
            .values()
            .filter(|spec| spec.searchable_text().contains(&query))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.agents.clear();
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// State shared between the registry façade and its watcher tasks.
#[derive(Debug)]
pub(crate) struct RegistryShared {
    pub(crate) index: RwLock<AgentIndex>,
    pub(crate) errors: RwLock<Vec<LoadError>>,
}

/// Rescan one watched directory from scratch. This is the authoritative
/// consistency mechanism; individual filesystem events are only hints.
pub(crate) async fn rescan_directory(
    shared: &RegistryShared,
    loader: &AgentLoader,
    dir: &Path,
    source: AgentSource,
) {
    if !dir.is_dir() {
        let removed = shared.index.write().await.unregister_under(dir);
        if !removed.is_empty() {
            info!(dir = %dir.display(), count = removed.len(), "watched directory removed");
        }
        return;
    }

    let on_disk = agent_files_in(dir);

    // Files whose mtime matches the record already loaded from them are
    // carried forward without re-parsing.
    let unchanged: std::collections::HashSet<PathBuf> = {
        let index = shared.index.read().await;
        index
            .agents
            .values()
            .filter_map(|spec| {
                let path = spec.file_path.as_deref()?;
                let previous = spec.last_modified?;
                let current = std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .map(chrono::DateTime::<chrono::Utc>::from)?;
                (path.parent() == Some(dir) && current == previous)
                    .then(|| path.to_path_buf())
            })
            .collect()
    };

    let mut fresh_errors = Vec::new();
    let mut parsed = Vec::new();
    for path in &on_disk {
        if unchanged.contains(path) {
            continue;
        }
        parsed.push((
            path.clone(),
            loader
                .load_agent_file(path, source)
                .map_err(|err| {
                    fresh_errors.push(err.clone());
                    err
                }),
        ));
    }

    let mut index = shared.index.write().await;

    // Drop agents whose files vanished from this directory.
    let stale: Vec<String> = index
        .agents
        .values()
        .filter(|spec| {
            spec.file_path.as_deref().is_some_and(|p| {
                p.parent() == Some(dir) && !on_disk.iter().any(|f| f == p)
            })
        })
        .map(|spec| spec.name.clone())
        .collect();
    for name in stale {
        debug!(agent = %name, "unregistering agent whose file was removed");
        index.unregister(&name);
    }

    for (path, result) in parsed {
        match result {
            Ok(spec) => {
                index.register_scanned(spec);
            }
            Err(err) => {
                // A file that no longer parses takes its previous record
                // down with it; the error stays off the routing surface.
                warn!(path = %path.display(), error = %err, "agent file failed to reload");
                if let Some(name) = index.name_for_path(&path) {
                    index.unregister(&name);
                }
            }
        }
    }
    drop(index);

    let mut errors = shared.errors.write().await;
    errors.retain(|e| e.path.parent() != Some(dir));
    errors.extend(fresh_errors);
}

/// Async façade over the agent index: loads definitions, serializes writes,
/// and keeps the index consistent with the watched directories.
pub struct AgentRegistry {
    loader: AgentLoader,
    shared: Arc<RegistryShared>,
    watcher: Mutex<Option<DirectoryWatcher>>,
}

impl AgentRegistry {
    pub fn new(loader: AgentLoader) -> Self {
        Self {
            loader,
            shared: Arc::new(RegistryShared {
                index: RwLock::new(AgentIndex::new()),
                errors: RwLock::new(Vec::new()),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn loader(&self) -> &AgentLoader {
        &self.loader
    }

    /// Populate the index from disk and start watching the agent
    /// directories. Returns the same outcome record the loader produced.
    pub async fn init(&self) -> Result<LoadOutcome, RegistryError> {
        let outcome = self.loader.load_agents();
        {
            let mut index = self.shared.index.write().await;
            index.clear();
            for spec in &outcome.agents {
                index.register(spec.clone());
            }
        }
        *self.shared.errors.write().await = outcome.errors.clone();

        let watcher = DirectoryWatcher::start(
            self.loader.agent_dirs(),
            self.loader.clone(),
            self.shared.clone(),
        )?;
        *self.watcher.lock().await = Some(watcher);

        info!(
            agents = outcome.agents.len(),
            errors = outcome.errors.len(),
            files = outcome.files_processed,
            "agent registry initialized"
        );
        Ok(outcome)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<AgentSpec>> {
        self.shared.index.read().await.get(name)
    }

    pub async fn list(&self) -> Vec<Arc<AgentSpec>> {
        self.shared.index.read().await.list()
    }

    pub async fn find(&self, keywords: &[&str]) -> Vec<Arc<AgentSpec>> {
        self.shared.index.read().await.find(keywords)
    }

    pub async fn find_by_exact_keywords(&self, keywords: &[&str]) -> Vec<Arc<AgentSpec>> {
        self.shared.index.read().await.find_by_exact_keywords(keywords)
    }

    pub async fn search_text(&self, query: &str) -> Vec<Arc<AgentSpec>> {
        self.shared.index.read().await.search_text(query)
    }

    pub async fn register(&self, spec: AgentSpec) -> Arc<AgentSpec> {
        self.shared.index.write().await.register(spec)
    }

    pub async fn unregister(&self, name: &str) -> Option<Arc<AgentSpec>> {
        self.shared.index.write().await.unregister(name)
    }

    pub async fn clear(&self) {
        self.shared.index.write().await.clear();
    }

    pub async fn size(&self) -> usize {
        self.shared.index.read().await.len()
    }

    /// Errors from the most recent scan of each directory.
    pub async fn last_errors(&self) -> Vec<LoadError> {
        self.shared.errors.read().await.clone()
    }

    /// Rebuild the whole index from disk.
    pub async fn reload(&self) -> ReloadReport {
        let before = self.shared.index.read().await.names();
        let outcome = self.loader.load_agents();

        let mut index = self.shared.index.write().await;
        index.clear();
        for spec in &outcome.agents {
            index.register(spec.clone());
        }
        let removed = before
            .iter()
            .filter(|name| index.get(name).is_none())
            .count();
        drop(index);

        let errors = outcome.errors.len();
        *self.shared.errors.write().await = outcome.errors;

        ReloadReport {
            loaded: outcome.agents.len(),
            removed,
            errors,
        }
    }

    /// Reload one file in place. A file that fails to load unregisters the
    /// record it previously produced.
    pub async fn reload_file(&self, path: &Path) -> Result<Arc<AgentSpec>, LoadError> {
        let source = self.source_for(path);
        match self.loader.load_agent_file(path, source) {
            Ok(spec) => Ok(self.shared.index.write().await.register(spec)),
            Err(err) => {
                let mut index = self.shared.index.write().await;
                if let Some(name) = index.name_for_path(path) {
                    warn!(agent = %name, path = %path.display(), "unregistering after failed reload");
                    index.unregister(&name);
                }
                Err(err)
            }
        }
    }

    /// Stop the watcher tasks and release their resources. The index itself
    /// stays usable afterwards.
    pub async fn dispose(&self) {
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.shutdown();
        }
    }

    fn source_for(&self, path: &Path) -> AgentSource {
        self.loader
            .agent_dirs()
            .into_iter()
            .find(|(dir, _)| path.starts_with(dir))
            .map(|(_, source)| source)
            .unwrap_or(AgentSource::Project)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("project_root", &self.loader.project_root())
            .finish_non_exhaustive()
    }
}
