use std::path::PathBuf;
use std::sync::Arc;

use crate::db::Database;
use crate::error::MapMarkError;
use crate::proxy::MapProxy;
use crate::upload::UploadStore;

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub uploads: Arc<UploadStore>,
    pub proxy: Arc<MapProxy>,
    pub static_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(db: Database, uploads: UploadStore, proxy: MapProxy, static_dir: PathBuf) -> Self {
        Self {
            db,
            uploads: Arc::new(uploads),
            proxy: Arc::new(proxy),
            static_dir: Arc::new(static_dir),
        }
    }
}

/// Runs SQLite and filesystem work on the blocking pool so it never stalls
/// the async workers.
pub async fn blocking<T, F>(f: F) -> Result<T, MapMarkError>
where
    F: FnOnce() -> Result<T, MapMarkError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MapMarkError::Error(format!("Blocking task failed: {}", e)))?
}
