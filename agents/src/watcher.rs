use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::RegistryError;
use crate::loader::AgentLoader;
use crate::registry::RegistryShared;
use crate::registry::rescan_directory;
use crate::spec::AgentSource;

/// Quiet period before a burst of filesystem events triggers a rescan.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watches agent directories and drives debounced rescans. Platform events
/// are treated as hints only; every firing rescans the directory from
/// scratch, and rescans for one directory never overlap because each runs
/// on that directory's own task.
pub(crate) struct DirectoryWatcher {
    watchers: Vec<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    pub(crate) fn start(
        dirs: Vec<(PathBuf, AgentSource)>,
        loader: AgentLoader,
        shared: Arc<RegistryShared>,
    ) -> Result<Self, RegistryError> {
        let mut watchers = Vec::new();
        let mut tasks = Vec::new();

        for (dir, source) in dirs {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "skipping missing agent directory");
                continue;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let mut watcher =
                notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                    match res {
                        // The rescan decides what actually changed; any
                        // event in the directory is worth a wake-up.
                        Ok(_) => {
                            let _ = tx.send(());
                        }
                        Err(err) => warn!(error = %err, "filesystem watcher error"),
                    }
                })
                .map_err(|source| RegistryError::Watch {
                    path: dir.clone(),
                    source,
                })?;
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|source| RegistryError::Watch {
                    path: dir.clone(),
                    source,
                })?;
            watchers.push(watcher);

            tasks.push(tokio::spawn(debounce_loop(
                rx,
                dir,
                source,
                loader.clone(),
                shared.clone(),
            )));
        }

        Ok(Self { watchers, tasks })
    }

    pub(crate) fn shutdown(self) {
        // Dropping the watchers closes the event channels; aborting makes
        // release immediate rather than waiting on an in-flight debounce.
        drop(self.watchers);
        for task in self.tasks {
            task.abort();
        }
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<()>,
    dir: PathBuf,
    source: AgentSource,
    loader: AgentLoader,
    shared: Arc<RegistryShared>,
) {
    while rx.recv().await.is_some() {
        // Coalesce the burst: keep absorbing events until the directory has
        // been quiet for the debounce window.
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        debug!(dir = %dir.display(), "rescanning after filesystem change");
        rescan_directory(&shared, &loader, &dir, source).await;
    }
}
