use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tempfile::NamedTempFile;
use tokio::{io::AsyncWriteExt, sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::key::SourceKey;
use crate::config::{format_size, Config};
use crate::error::{EngineError, FetchError};
use crate::events::{EngineEvent, Notifier};

/// Salida del pipeline externo de descarga + transcodificación
pub struct FetchedAudio {
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    /// Tamaño esperado, si el origen lo conoce
    pub size_hint: Option<u64>,
}

impl FetchedAudio {
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let size_hint = Some(data.len() as u64);
        Self {
            stream: futures::stream::once(async move { Ok(data) }).boxed(),
            size_hint,
        }
    }
}

/// Fetch + transcode step the cache calls on a miss.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &SourceKey) -> Result<FetchedAudio, FetchError>;
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub ceiling_bytes: u64,
    pub fetch_timeout: Duration,
    pub failed_cooldown: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dir: config.cache_dir.clone(),
            ceiling_bytes: config.cache_limit_bytes,
            fetch_timeout: config.fetch_timeout,
            failed_cooldown: config.failed_fetch_cooldown,
        }
    }
}

/// Caché de artefactos de audio compartido por todas las sesiones.
///
/// Cloning is cheap; every clone addresses the same index.
#[derive(Clone)]
pub struct AudioCache {
    pub(super) inner: Arc<CacheInner>,
}

pub(super) struct CacheInner {
    pub(super) dir: PathBuf,
    pub(super) tmp_dir: PathBuf,
    ceiling_bytes: u64,
    fetch_timeout: Duration,
    failed_cooldown: Duration,
    fetcher: Arc<dyn Fetcher>,
    notifier: Notifier,
    pub(super) index: Mutex<CacheIndex>,
    fetches_started: AtomicU64,
}

#[derive(Default)]
pub(super) struct CacheIndex {
    pub(super) entries: HashMap<SourceKey, CacheEntry>,
    pub(super) total_bytes: u64,
    next_id: u64,
    access_seq: u64,
}

impl CacheIndex {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(super) fn next_access(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    /// Registra un artefacto ya presente en disco (reconciliación al arrancar)
    pub(super) fn insert_ready(
        &mut self,
        key: SourceKey,
        path: PathBuf,
        size_bytes: u64,
        last_accessed_at: DateTime<Utc>,
        cached_at: DateTime<Utc>,
    ) {
        let id = self.next_id();
        let access_seq = self.next_access();
        self.total_bytes += size_bytes;
        self.entries.insert(
            key,
            CacheEntry {
                id,
                size_bytes,
                path,
                last_accessed_at,
                access_seq,
                cached_at,
                state: EntryState::Ready,
                ref_count: 0,
                waiters: 0,
            },
        );
    }
}

pub(super) struct CacheEntry {
    pub(super) id: u64,
    pub(super) size_bytes: u64,
    pub(super) path: PathBuf,
    pub(super) last_accessed_at: DateTime<Utc>,
    /// Orden de recencia; el menor es el menos usado recientemente
    pub(super) access_seq: u64,
    pub(super) cached_at: DateTime<Utc>,
    pub(super) state: EntryState,
    pub(super) ref_count: u32,
    /// Llamadas a `acquire` esperando el fetch en curso
    waiters: u32,
}

pub(super) enum EntryState {
    Fetching {
        done: watch::Receiver<Option<FetchOutcome>>,
    },
    Ready,
    Failed {
        error: FetchError,
        retry_at: Instant,
    },
}

#[derive(Debug, Clone)]
pub(super) struct ArtifactInfo {
    path: PathBuf,
    size_bytes: u64,
}

pub(super) type FetchOutcome = Result<ArtifactInfo, FetchError>;

/// Lectura activa de un artefacto `Ready`.
///
/// While a handle exists its entry cannot be evicted. Dropping it (or passing
/// it to [`AudioCache::release`]) decrements the reference count.
pub struct ArtifactHandle {
    inner: Arc<CacheInner>,
    key: SourceKey,
    entry_id: u64,
    path: PathBuf,
    size_bytes: u64,
}

impl ArtifactHandle {
    pub fn key(&self) -> &SourceKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("key", &self.key)
            .field("entry_id", &self.entry_id)
            .field("size_bytes", &self.size_bytes)
            .finish()
    }
}

impl Drop for ArtifactHandle {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.entry_id);
    }
}

/// Reserva de un waiter sobre un fetch en curso.
///
/// The fetch task adds one reference per registered waiter when it turns the
/// entry `Ready`. A claim dropped before it becomes a handle gives back
/// whichever of the two it is holding.
struct PendingClaim {
    inner: Arc<CacheInner>,
    key: SourceKey,
    entry_id: u64,
    armed: bool,
}

impl PendingClaim {
    fn into_handle(mut self, info: ArtifactInfo) -> ArtifactHandle {
        self.armed = false;
        ArtifactHandle {
            inner: self.inner.clone(),
            key: self.key.clone(),
            entry_id: self.entry_id,
            path: info.path,
            size_bytes: info.size_bytes,
        }
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut index = self.inner.index.lock();
        if let Some(entry) = index.entries.get_mut(&self.key) {
            if entry.id != self.entry_id {
                return;
            }
            match entry.state {
                EntryState::Fetching { .. } => entry.waiters = entry.waiters.saturating_sub(1),
                EntryState::Ready => entry.ref_count = entry.ref_count.saturating_sub(1),
                EntryState::Failed { .. } => {}
            }
        }
    }
}

/// Deja la entrada en `Failed` si la tarea de fetch termina sin resolver
/// (abortada, panic, runtime apagándose).
struct FetchGuard {
    inner: Arc<CacheInner>,
    key: SourceKey,
    entry_id: u64,
    tx: Option<watch::Sender<Option<FetchOutcome>>>,
}

impl FetchGuard {
    fn settle(&mut self, result: Result<(NamedTempFile, u64), FetchError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let outcome = self.inner.complete_fetch(&self.key, self.entry_id, result);
        tx.send_replace(Some(outcome));
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.settle(Err(FetchError::transient("fetch cancelled")));
        }
    }
}

enum Lookup {
    Ready(ArtifactHandle),
    Wait {
        claim: PendingClaim,
        done: watch::Receiver<Option<FetchOutcome>>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<(SourceKey, u64)>,
    pub bytes_freed: u64,
    /// Seguimos sobre el techo porque todo lo restante está fijado
    pub still_over_budget: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub key: SourceKey,
    pub size_bytes: u64,
    pub cached_at: DateTime<Utc>,
    pub ref_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub ceiling_bytes: u64,
    pub ready: usize,
    pub fetching: usize,
    pub failed: usize,
    pub pinned: usize,
    pub fetches_started: u64,
    /// Artefactos más recientes primero
    pub recent: Vec<CachedArtifact>,
}

impl CacheStats {
    pub fn usage_percent(&self) -> f64 {
        if self.ceiling_bytes == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.ceiling_bytes as f64 * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "📊 Cache Stats:\n\
             💾 Size: {} / {} ({:.1}%)\n\
             📦 Entries: {} ready, {} fetching, {} failed, {} pinned\n\
             ⬇️ Fetches started: {}",
            format_size(self.total_bytes),
            format_size(self.ceiling_bytes),
            self.usage_percent(),
            self.ready,
            self.fetching,
            self.failed,
            self.pinned,
            self.fetches_started
        )
    }
}

impl AudioCache {
    /// Crea un caché vacío (sin reconciliar el disco; ver [`AudioCache::open`])
    pub fn new(
        settings: CacheSettings,
        fetcher: Arc<dyn Fetcher>,
        notifier: Notifier,
    ) -> Result<Self, EngineError> {
        let tmp_dir = settings.dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                dir: settings.dir,
                tmp_dir,
                ceiling_bytes: settings.ceiling_bytes,
                fetch_timeout: settings.fetch_timeout,
                failed_cooldown: settings.failed_cooldown,
                fetcher,
                notifier,
                index: Mutex::new(CacheIndex::default()),
                fetches_started: AtomicU64::new(0),
            }),
        })
    }

    /// Obtiene un artefacto listo, descargándolo si hace falta.
    ///
    /// Concurrent calls for the same key share one fetch. The returned handle
    /// pins the entry until dropped.
    pub async fn acquire(&self, key: &SourceKey) -> Result<ArtifactHandle, FetchError> {
        let (claim, mut done) = match self.inner.lookup_or_start(key)? {
            Lookup::Ready(handle) => return Ok(handle),
            Lookup::Wait { claim, done } => (claim, done),
        };

        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(Ok(info)) => Ok(claim.into_handle(info)),
            Some(Err(error)) => Err(error),
            None => Err(FetchError::transient("fetch task dropped without a result")),
        }
    }

    /// Libera explícitamente un handle (equivalente a `drop`)
    pub fn release(&self, handle: ArtifactHandle) {
        drop(handle);
    }

    /// Evicts unpinned `Ready` entries, least recently used first, until the
    /// total is back under the ceiling or only pinned entries remain.
    pub fn evict_if_over_budget(&self) -> EvictionReport {
        self.inner.evict_if_over_budget()
    }

    /// Elimina una entrada sin importar su recencia
    pub fn invalidate(&self, key: &SourceKey) -> Result<u64, EngineError> {
        let removed = {
            let mut index = self.inner.index.lock();
            let entry = index
                .entries
                .remove(key)
                .ok_or_else(|| EngineError::NotFound(key.clone()))?;
            index.total_bytes = index.total_bytes.saturating_sub(entry.size_bytes);
            entry
        };
        // unlink fuera del lock
        if matches!(removed.state, EntryState::Ready) {
            remove_artifact(&removed.path);
        }

        info!(
            "🗑️ Artefacto invalidado: {} ({}, {} lectores activos)",
            key,
            format_size(removed.size_bytes),
            removed.ref_count
        );
        Ok(removed.size_bytes)
    }

    /// Quita las entradas `Failed` cuyo cool-down ya venció
    pub fn purge_expired_failures(&self) -> usize {
        let now = Instant::now();
        let mut index = self.inner.index.lock();
        let before = index.entries.len();
        index.entries.retain(|_, entry| match &entry.state {
            EntryState::Failed { retry_at, .. } => *retry_at > now,
            _ => true,
        });
        let purged = before - index.entries.len();
        if purged > 0 {
            debug!("🧹 {} entradas fallidas expiradas", purged);
        }
        purged
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.index.lock().total_bytes
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.inner.ceiling_bytes
    }

    pub fn contains_ready(&self, key: &SourceKey) -> bool {
        self.inner
            .index
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| matches!(e.state, EntryState::Ready))
    }

    pub fn ref_count(&self, key: &SourceKey) -> Option<u32> {
        self.inner.index.lock().entries.get(key).map(|e| e.ref_count)
    }

    pub fn stats(&self, recent_limit: usize) -> CacheStats {
        let index = self.inner.index.lock();
        let mut stats = CacheStats {
            total_bytes: index.total_bytes,
            ceiling_bytes: self.inner.ceiling_bytes,
            ready: 0,
            fetching: 0,
            failed: 0,
            pinned: 0,
            fetches_started: self.inner.fetches_started.load(Ordering::Relaxed),
            recent: Vec::new(),
        };

        for (key, entry) in &index.entries {
            match entry.state {
                EntryState::Ready => {
                    stats.ready += 1;
                    stats.recent.push(CachedArtifact {
                        key: key.clone(),
                        size_bytes: entry.size_bytes,
                        cached_at: entry.cached_at,
                        ref_count: entry.ref_count,
                    });
                }
                EntryState::Fetching { .. } => stats.fetching += 1,
                EntryState::Failed { .. } => stats.failed += 1,
            }
            if entry.ref_count > 0 {
                stats.pinned += 1;
            }
        }

        stats
            .recent
            .sort_by(|a, b| b.cached_at.cmp(&a.cached_at).then_with(|| a.key.cmp(&b.key)));
        stats.recent.truncate(recent_limit);
        stats
    }

    /// Limpieza periódica: fallidos expirados, evicción e índice en disco
    pub async fn run_maintenance(&self) {
        self.purge_expired_failures();
        self.evict_if_over_budget();
        if let Err(e) = self.save_index().await {
            warn!("⚠️ No se pudo guardar el índice del caché: {}", e);
        }
    }

    pub fn spawn_maintenance(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cache.run_maintenance().await,
                }
            }
            debug!("🧹 Mantenimiento del caché detenido");
        })
    }
}

impl fmt::Debug for AudioCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioCache")
            .field("dir", &self.inner.dir)
            .field("ceiling_bytes", &self.inner.ceiling_bytes)
            .finish()
    }
}

impl CacheInner {
    fn lookup_or_start(self: &Arc<Self>, key: &SourceKey) -> Result<Lookup, FetchError> {
        let mut index = self.index.lock();
        let seq = index.next_access();

        if let Some(entry) = index.entries.get_mut(key) {
            match &entry.state {
                EntryState::Ready => {
                    entry.last_accessed_at = Utc::now();
                    entry.access_seq = seq;
                    entry.ref_count += 1;
                    debug!("🎯 Cache hit: {} (refs={})", key, entry.ref_count);
                    return Ok(Lookup::Ready(ArtifactHandle {
                        inner: self.clone(),
                        key: key.clone(),
                        entry_id: entry.id,
                        path: entry.path.clone(),
                        size_bytes: entry.size_bytes,
                    }));
                }
                EntryState::Fetching { done } => {
                    let done = done.clone();
                    entry.waiters += 1;
                    debug!("⏳ Esperando fetch en curso: {}", key);
                    return Ok(Lookup::Wait {
                        claim: PendingClaim {
                            inner: self.clone(),
                            key: key.clone(),
                            entry_id: entry.id,
                            armed: true,
                        },
                        done,
                    });
                }
                EntryState::Failed { error, retry_at } => {
                    if Instant::now() < *retry_at {
                        debug!("🚫 {} en cool-down: {}", key, error);
                        return Err(error.clone());
                    }
                }
            }
        }

        // Miss (o fallo vencido): esta llamada lidera el fetch
        let entry_id = index.next_id();
        let (tx, done) = watch::channel(None);
        let now = Utc::now();
        index.entries.insert(
            key.clone(),
            CacheEntry {
                id: entry_id,
                size_bytes: 0,
                path: self.dir.join(key.artifact_file_name()),
                last_accessed_at: now,
                access_seq: seq,
                cached_at: now,
                state: EntryState::Fetching { done: done.clone() },
                ref_count: 0,
                waiters: 1,
            },
        );
        drop(index);

        self.fetches_started.fetch_add(1, Ordering::Relaxed);
        let guard = FetchGuard {
            inner: self.clone(),
            key: key.clone(),
            entry_id,
            tx: Some(tx),
        };
        tokio::spawn(run_fetch(self.clone(), guard));

        Ok(Lookup::Wait {
            claim: PendingClaim {
                inner: self.clone(),
                key: key.clone(),
                entry_id,
                armed: true,
            },
            done,
        })
    }

    async fn download(
        &self,
        key: &SourceKey,
        entry_id: u64,
    ) -> Result<(NamedTempFile, u64), FetchError> {
        let fetched = self.fetcher.fetch(key).await?;

        let tmp = tempfile::Builder::new()
            .prefix("fetch-")
            .suffix(".part")
            .tempfile_in(&self.tmp_dir)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);

        let mut stream = fetched.stream;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::transient(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if !self.record_partial(key, entry_id, chunk.len() as u64) {
                return Err(FetchError::transient("entry invalidated during fetch"));
            }
        }
        file.flush().await?;
        drop(file);

        if written == 0 {
            return Err(FetchError::permanent(format!("{} produced no audio", key)));
        }
        if let Some(expected) = fetched.size_hint.filter(|&expected| expected != written) {
            debug!("{}: tamaño esperado {} pero se escribieron {}", key, expected, written);
        }

        Ok((tmp, written))
    }

    /// Suma bytes parciales al total mientras el fetch avanza
    fn record_partial(&self, key: &SourceKey, entry_id: u64, bytes: u64) -> bool {
        let mut index = self.index.lock();
        let CacheIndex {
            entries,
            total_bytes,
            ..
        } = &mut *index;
        match entries.get_mut(key) {
            Some(entry) if entry.id == entry_id => {
                entry.size_bytes += bytes;
                *total_bytes += bytes;
                true
            }
            _ => false,
        }
    }

    fn complete_fetch(
        &self,
        key: &SourceKey,
        entry_id: u64,
        result: Result<(NamedTempFile, u64), FetchError>,
    ) -> FetchOutcome {
        let mut index = self.index.lock();
        let seq = index.next_access();
        let CacheIndex {
            entries,
            total_bytes,
            ..
        } = &mut *index;

        let entry = match entries.get_mut(key) {
            Some(entry) if entry.id == entry_id => entry,
            _ => {
                debug!("{} fue invalidado durante el fetch; descartando", key);
                return Err(FetchError::transient(format!(
                    "{} was invalidated during fetch",
                    key
                )));
            }
        };

        // Los bytes parciales se reemplazan por el tamaño final
        *total_bytes = total_bytes.saturating_sub(entry.size_bytes);
        entry.size_bytes = 0;

        let outcome = result.and_then(|(tmp, size_bytes)| {
            tmp.persist(&entry.path)
                .map_err(|e| FetchError::transient(e.error.to_string()))?;
            Ok(ArtifactInfo {
                path: entry.path.clone(),
                size_bytes,
            })
        });

        match &outcome {
            Ok(info) => {
                entry.size_bytes = info.size_bytes;
                *total_bytes += info.size_bytes;
                entry.state = EntryState::Ready;
                entry.ref_count += entry.waiters;
                entry.waiters = 0;
                entry.cached_at = Utc::now();
                entry.last_accessed_at = entry.cached_at;
                entry.access_seq = seq;
                info!(
                    "✅ Artefacto listo: {} ({}, {} lectores)",
                    key,
                    format_size(info.size_bytes),
                    entry.ref_count
                );
            }
            Err(error) => {
                let retry_at = if error.is_retryable() {
                    Instant::now()
                } else {
                    Instant::now() + self.failed_cooldown
                };
                entry.state = EntryState::Failed {
                    error: error.clone(),
                    retry_at,
                };
                entry.waiters = 0;
                warn!("❌ Fetch fallido para {}: {}", key, error);
            }
        }

        outcome
    }

    fn release(&self, key: &SourceKey, entry_id: u64) {
        let mut index = self.index.lock();
        if let Some(entry) = index.entries.get_mut(key) {
            if entry.id == entry_id {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    debug!("📌 {} sin lectores, elegible para evicción", key);
                }
            }
        }
    }

    pub(super) fn evict_if_over_budget(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut evicted_events = Vec::new();
        let mut doomed = Vec::new();

        {
            let mut index = self.index.lock();
            while index.total_bytes > self.ceiling_bytes {
                let victim = index
                    .entries
                    .iter()
                    .filter(|(_, e)| matches!(e.state, EntryState::Ready) && e.ref_count == 0)
                    .min_by_key(|(_, e)| e.access_seq)
                    .map(|(k, _)| k.clone());

                let Some(key) = victim else {
                    warn!(
                        "⚠️ Caché sobre el límite ({} / {}) pero todo está fijado",
                        format_size(index.total_bytes),
                        format_size(self.ceiling_bytes)
                    );
                    report.still_over_budget = true;
                    break;
                };

                if let Some(entry) = index.entries.remove(&key) {
                    index.total_bytes = index.total_bytes.saturating_sub(entry.size_bytes);
                    doomed.push(entry.path);
                    report.bytes_freed += entry.size_bytes;
                    report.evicted.push((key.clone(), entry.size_bytes));
                    evicted_events.push(EngineEvent::CacheEvicted {
                        key,
                        bytes_freed: entry.size_bytes,
                    });
                }
            }
        }

        for path in &doomed {
            remove_artifact(path);
        }

        if !report.evicted.is_empty() {
            info!(
                "🧹 Evicción: {} artefactos, {} liberados",
                report.evicted.len(),
                format_size(report.bytes_freed)
            );
        }
        for event in evicted_events {
            self.notifier.emit(event);
        }

        report
    }
}

async fn run_fetch(inner: Arc<CacheInner>, mut guard: FetchGuard) {
    info!("⬇️ Descargando {}", guard.key);

    let result = match tokio::time::timeout(
        inner.fetch_timeout,
        inner.download(&guard.key, guard.entry_id),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(FetchError::timeout(format!(
            "fetch exceeded {}",
            humantime::format_duration(inner.fetch_timeout)
        ))),
    };

    guard.settle(result);
    inner.evict_if_over_budget();
}

pub(super) fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Error eliminando {}: {}", path.display(), e),
    }
}
