use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{error, warn};

/// Something that can be hot-reloaded from files in a directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;

    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls a directory and forwards file changes to a [`WatchedType`]. Dropping
/// or shutting it down stops both the poller and the dispatch task.
pub struct DirectoryWatcher {
    _poller: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Starts watching `dir`. With `initial_scan`, every relevant file already
    /// present is loaded first; failed loads are retried when `retry` is set.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        initial_scan: bool,
        retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path, retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) = mpsc::unbounded_channel();
        let mut poller = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        poller.watch(&dir, RecursiveMode::NonRecursive)?;

        let dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(?e, "Watcher error");
                        continue;
                    }
                };
                for path in event.paths.iter().filter(|p| watched.is_relevant(p)) {
                    let result = match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) => watched.on_create_or_modify(path).await,
                        EventKind::Remove(_) => watched.on_remove(path).await,
                        _ => Ok(()),
                    };
                    if let Err(e) = result {
                        warn!(?path, ?e, "Failed to handle file change");
                    }
                }
            }
        });

        Ok(DirectoryWatcher {
            _poller: poller,
            dispatch,
        })
    }

    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

/// True when `path` has one of `extensions` (case-insensitive).
pub fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 5;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
