use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::Path, sync::Arc};
use tracing::{debug, info, warn};

use super::audio_cache::{AudioCache, CacheSettings, EntryState, Fetcher};
use super::key::SourceKey;
use crate::config::format_size;
use crate::error::EngineError;
use crate::events::Notifier;

pub const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: SourceKey,
    size_bytes: u64,
    last_accessed_at: DateTime<Utc>,
    cached_at: DateTime<Utc>,
}

/// Resultado de reconciliar índice y directorio al arrancar
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entradas del índice cuyo archivo sigue en disco
    pub restored: usize,
    /// Archivos en disco que el índice no conocía (borrados)
    pub orphans_removed: usize,
    /// Entradas del índice sin archivo (descartadas)
    pub missing: usize,
    pub evicted: usize,
}

impl AudioCache {
    /// Abre el caché en `settings.dir`, restaurando el índice persistido.
    ///
    /// Partial downloads under `tmp/` are discarded, indexed entries whose file
    /// vanished are dropped, and unindexed files are deleted. The result is
    /// then trimmed to the ceiling.
    pub async fn open(
        settings: CacheSettings,
        fetcher: Arc<dyn Fetcher>,
        notifier: Notifier,
    ) -> Result<(Self, ReconcileReport), EngineError> {
        let tmp_dir = settings.dir.join("tmp");
        if tokio::fs::try_exists(&tmp_dir).await? {
            tokio::fs::remove_dir_all(&tmp_dir).await?;
        }

        let cache = AudioCache::new(settings, fetcher, notifier)?;
        let mut report = ReconcileReport::default();

        let mut persisted = read_index(&cache.inner.dir.join(INDEX_FILE)).await;
        persisted.sort_by_key(|e| e.last_accessed_at);

        let mut known = HashSet::new();
        for entry in persisted {
            let file_name = entry.key.artifact_file_name();
            let path = cache.inner.dir.join(&file_name);
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {
                    if meta.len() != entry.size_bytes {
                        debug!(
                            "{}: tamaño en índice {} pero en disco {}",
                            entry.key,
                            entry.size_bytes,
                            meta.len()
                        );
                    }
                    cache.inner.index.lock().insert_ready(
                        entry.key,
                        path,
                        meta.len(),
                        entry.last_accessed_at,
                        entry.cached_at,
                    );
                    known.insert(file_name);
                    report.restored += 1;
                }
                _ => {
                    debug!("Artefacto perdido para {}, descartando", entry.key);
                    report.missing += 1;
                }
            }
        }

        let mut dir = tokio::fs::read_dir(&cache.inner.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            let name = item.file_name().to_string_lossy().into_owned();
            if name == INDEX_FILE || known.contains(&name) {
                continue;
            }
            match tokio::fs::remove_file(item.path()).await {
                Ok(()) => report.orphans_removed += 1,
                Err(e) => warn!("No se pudo borrar huérfano {}: {}", name, e),
            }
        }

        report.evicted = cache.evict_if_over_budget().evicted.len();

        info!(
            "📂 Caché abierto: {} restaurados ({}), {} huérfanos borrados, {} perdidos",
            report.restored,
            format_size(cache.total_bytes()),
            report.orphans_removed,
            report.missing
        );

        Ok((cache, report))
    }

    /// Escribe las entradas `Ready` a `index.json` (tmp + rename)
    pub async fn save_index(&self) -> Result<(), EngineError> {
        let snapshot = {
            let index = self.inner.index.lock();
            let mut entries: Vec<PersistedEntry> = index
                .entries
                .iter()
                .filter(|(_, e)| matches!(e.state, EntryState::Ready))
                .map(|(key, e)| PersistedEntry {
                    key: key.clone(),
                    size_bytes: e.size_bytes,
                    last_accessed_at: e.last_accessed_at,
                    cached_at: e.cached_at,
                })
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            PersistedIndex {
                version: INDEX_VERSION,
                entries,
            }
        };

        let content = serde_json::to_string_pretty(&snapshot)?;
        let path = self.inner.dir.join(INDEX_FILE);
        let tmp = self.inner.dir.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("💾 Índice guardado: {} entradas", snapshot.entries.len());
        Ok(())
    }
}

async fn read_index(path: &Path) -> Vec<PersistedEntry> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("No se pudo leer {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<PersistedIndex>(&content) {
        Ok(index) if index.version == INDEX_VERSION => index.entries,
        Ok(index) => {
            warn!("Versión de índice desconocida {}, empezando vacío", index.version);
            Vec::new()
        }
        Err(e) => {
            warn!("Índice corrupto ({}), empezando vacío", e);
            Vec::new()
        }
    }
}
