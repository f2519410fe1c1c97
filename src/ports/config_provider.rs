use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::ConfigSnapshot;

/// Source of application snapshots that can signal changes.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load a complete snapshot of the application directory.
    async fn load_snapshot(&self) -> Result<ConfigSnapshot>;

    /// Channel that ticks when the underlying documents changed.
    /// Only the first caller receives it.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;
}
