use dashmap::{mapref::entry::Entry, DashMap};
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::stream::StreamTiming;
use super::worker::{self, GuildHandle, WorkerDeps};
use crate::cache::AudioCache;
use crate::config::Config;
use crate::events::Notifier;
use crate::sources::{Resolver, Sink};
use crate::storage::SettingsProvider;

/// Registro de sesiones activas, una por servidor.
///
/// Every guild gets its own worker task; the only state they share is the
/// [`AudioCache`].
pub struct SessionManager {
    sessions: DashMap<GuildId, GuildHandle>,
    cache: AudioCache,
    settings: Arc<dyn SettingsProvider>,
    resolver: Arc<dyn Resolver>,
    notifier: Notifier,
    timing: StreamTiming,
    max_history: usize,
    max_consecutive_failures: u32,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        cache: AudioCache,
        settings: Arc<dyn SettingsProvider>,
        resolver: Arc<dyn Resolver>,
        notifier: Notifier,
    ) -> Self {
        info!("🎵 Inicializando SessionManager");
        Self {
            sessions: DashMap::new(),
            cache,
            settings,
            resolver,
            notifier,
            timing: StreamTiming::from_config(config),
            max_history: config.max_history,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    /// Crea la sesión del servidor (o devuelve la existente)
    pub async fn join(&self, guild_id: GuildId, sink: Arc<dyn Sink>) -> GuildHandle {
        if let Some(handle) = self.get(guild_id) {
            return handle;
        }

        let handle = worker::spawn(
            guild_id,
            sink,
            WorkerDeps {
                cache: self.cache.clone(),
                settings: self.settings.clone(),
                resolver: self.resolver.clone(),
                notifier: self.notifier.clone(),
                timing: self.timing,
                max_history: self.max_history,
                max_consecutive_failures: self.max_consecutive_failures,
            },
        )
        .await;

        // otra tarea pudo unirse mientras el worker arrancaba
        let existing = match self.sessions.entry(guild_id) {
            Entry::Occupied(mut slot) => {
                if slot.get().is_closed() {
                    slot.insert(handle.clone());
                    None
                } else {
                    Some(slot.get().clone())
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                None
            }
        };

        match existing {
            Some(existing) => {
                handle.shutdown().await;
                existing
            }
            None => {
                info!("🔗 Sesión creada para guild {}", guild_id);
                handle
            }
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<GuildHandle> {
        self.sessions
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Destruye la sesión: detiene el stream y libera el artefacto
    pub async fn leave(&self, guild_id: GuildId) -> bool {
        let Some((_, handle)) = self.sessions.remove(&guild_id) else {
            return false;
        };
        handle.shutdown().await;
        info!("👋 Sesión cerrada para guild {}", guild_id);
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }

    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.sessions.iter().map(|e| *e.key()).collect();
        for guild_id in guilds {
            self.leave(guild_id).await;
        }
    }

    /// Mantenimiento periódico del caché compartido
    pub fn spawn_maintenance(
        &self,
        every: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.cache.spawn_maintenance(every, cancel)
    }
}
