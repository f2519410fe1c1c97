use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{
        loader::{APIS_DIR, load_snapshot},
        models::ConfigSnapshot,
    },
    ports::config_provider::ConfigProvider,
};

/// Loads an application directory and watches `config/` and `apis/` for changes.
pub struct FileConfigProvider {
    app_dir: PathBuf,
    _watcher: Option<notify::RecommendedWatcher>,
    update_tx: mpsc::Sender<()>,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    /// Provider without a filesystem watcher.
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            app_dir: app_dir.into(),
            _watcher: None,
            update_tx: tx,
            update_rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Provider that signals on every change to a route or config document.
    pub fn watching(app_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut provider = Self::new(app_dir);
        provider.init_watcher()?;
        Ok(provider)
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    fn init_watcher(&mut self) -> Result<()> {
        let tx = self.update_tx.clone();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event.paths.iter().any(|p| is_document(p))
                        {
                            tracing::debug!(kind = ?event.kind, paths = ?event.paths, "Application document changed");
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => tracing::error!("File watch error: {:?}", e),
                }
            })?;

        for dir in [self.app_dir.join("config"), self.app_dir.join(APIS_DIR)] {
            if dir.is_dir() {
                watcher
                    .watch(&dir, RecursiveMode::Recursive)
                    .wrap_err_with(|| format!("Failed to watch {}", dir.display()))?;
            } else {
                tracing::warn!(dir = %dir.display(), "Directory missing, not watching it");
            }
        }

        self._watcher = Some(watcher);
        Ok(())
    }
}

fn is_document(path: &Path) -> bool {
    path.extension() == Some(OsStr::new("json"))
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_snapshot(&self) -> Result<ConfigSnapshot> {
        load_snapshot(&self.app_dir)
            .await
            .wrap_err_with(|| format!("Failed to load {}", self.app_dir.display()))
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        match self.update_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
