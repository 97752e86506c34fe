//! Engine notifications.
//!
//! The command/UI layer consumes [`EngineEvent`]s from an [`EventStream`].
//! Delivery is best-effort: when the buffer is full the event is dropped and
//! logged, and nothing inside the engine depends on an event being seen.

use serenity::model::id::GuildId;
use tracing::debug;

use crate::audio::track::Track;
use crate::cache::SourceKey;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TrackStarted {
        guild_id: GuildId,
        track: Track,
        /// `auto_announce` del servidor al momento de empezar
        announce: bool,
    },
    TrackEnded {
        guild_id: GuildId,
        track: Track,
    },
    /// N tracks seguidos fallaron al cargar; la sesión volvió a idle
    QueueStalled {
        guild_id: GuildId,
        skipped: Vec<Track>,
    },
    /// La cola se vació; `skipped` son los tracks que fallaron desde el último éxito
    QueueExhausted {
        guild_id: GuildId,
        skipped: Vec<Track>,
    },
    /// La sesión sigue idle tras `idle_disconnect_secs`
    IdleTimeout {
        guild_id: GuildId,
    },
    CacheEvicted {
        key: SourceKey,
        bytes_freed: u64,
    },
}

/// Lado productor, clonable entre tareas
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: flume::Sender<EngineEvent>,
}

/// Lado consumidor
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: flume::Receiver<EngineEvent>,
}

pub fn channel(capacity: usize) -> (Notifier, EventStream) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    (Notifier { tx }, EventStream { rx })
}

impl Notifier {
    /// Notifier whose events go nowhere.
    pub fn disabled() -> Self {
        let (tx, _) = flume::bounded(1);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => {
                debug!("📭 Buffer de eventos lleno, descartando {:?}", event);
            }
            Err(flume::TrySendError::Disconnected(_)) => {}
        }
    }
}

impl EventStream {
    pub async fn recv(&self) -> Option<EngineEvent> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }

    /// Vacía lo pendiente sin esperar
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.rx.try_iter().collect()
    }
}
