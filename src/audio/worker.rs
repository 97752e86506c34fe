use serenity::model::id::{GuildId, UserId};
use std::{ops::Range, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::effects::DuckTracker;
use super::queue::{EnqueueMode, LoopMode, QueuePage, QueueManager};
use super::session::{NowPlaying, PlaybackSession, Step};
use super::stream::{PullLoop, StreamControl, StreamExit, StreamStart, StreamTiming};
use super::track::Track;
use crate::cache::{ArtifactHandle, AudioCache};
use crate::error::{EngineError, FetchError, Result};
use crate::events::{EngineEvent, Notifier};
use crate::sources::{Resolver, Sink};
use crate::storage::{GuildSettings, SettingsProvider};

const MAILBOX_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<T>;

/// Comandos que acepta el worker de un servidor, aplicados en orden de llegada
#[derive(Debug)]
pub enum GuildCommand {
    Enqueue {
        track: Track,
        mode: EnqueueMode,
        reply: Reply<Result<usize>>,
    },
    EnqueuePlaylist {
        tracks: Vec<Track>,
        reply: Reply<Result<usize>>,
    },
    Remove {
        position: usize,
        reply: Reply<Result<Track>>,
    },
    RemoveRange {
        range: Range<usize>,
        reply: Reply<Result<Vec<Track>>>,
    },
    Move {
        from: usize,
        to: usize,
        reply: Reply<Result<()>>,
    },
    Shuffle {
        reply: Reply<()>,
    },
    Clear {
        reply: Reply<usize>,
    },
    Page {
        page: usize,
        page_size: Option<usize>,
        reply: Reply<Result<QueuePage>>,
    },
    NowPlaying {
        reply: Reply<Option<NowPlaying>>,
    },
    History {
        reply: Reply<Vec<Track>>,
    },
    Pause {
        reply: Reply<Result<()>>,
    },
    Resume {
        reply: Reply<Result<()>>,
    },
    Seek {
        position_ms: u64,
        reply: Reply<Result<()>>,
    },
    FSeek {
        delta_ms: i64,
        reply: Reply<Result<()>>,
    },
    Skip {
        count: usize,
        reply: Reply<Result<()>>,
    },
    Unskip {
        reply: Reply<Result<()>>,
    },
    Stop {
        reply: Reply<usize>,
    },
    SetVolume {
        volume: u8,
        reply: Reply<Result<()>>,
    },
    SetLoop {
        mode: LoopMode,
        reply: Reply<()>,
    },
    VoiceActivity {
        user_id: UserId,
        speaking: bool,
    },
    /// El transporte reporta fin del track actual
    TrackEnded,
    Shutdown {
        reply: Reply<()>,
    },
}

/// Resultados de tareas propias del worker
enum Internal {
    Loaded {
        generation: u64,
        result: std::result::Result<ArtifactHandle, FetchError>,
    },
    StreamExited {
        generation: u64,
        exit: StreamExit,
    },
    IdleElapsed,
}

pub(crate) struct WorkerDeps {
    pub cache: AudioCache,
    pub settings: Arc<dyn SettingsProvider>,
    pub resolver: Arc<dyn Resolver>,
    pub notifier: Notifier,
    pub timing: StreamTiming,
    pub max_history: usize,
    pub max_consecutive_failures: u32,
}

struct GuildWorker {
    guild_id: GuildId,
    queue: QueueManager,
    session: PlaybackSession,
    ducks: DuckTracker,
    settings: GuildSettings,
    settings_provider: Arc<dyn SettingsProvider>,
    cache: AudioCache,
    notifier: Notifier,
    sink: Arc<dyn Sink>,
    timing: StreamTiming,
    control: watch::Sender<StreamControl>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    pull: Option<PullLoop>,
    loading: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

/// Arranca el worker de un servidor y devuelve su handle
pub(crate) async fn spawn(guild_id: GuildId, sink: Arc<dyn Sink>, deps: WorkerDeps) -> GuildHandle {
    let settings = deps.settings.guild_settings(guild_id).await;
    let session = PlaybackSession::new(settings.default_volume, deps.max_consecutive_failures);
    let (control, _) = watch::channel(session.control(settings.duck_volume));
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let mut worker = GuildWorker {
        guild_id,
        queue: QueueManager::new(settings.max_queue_size, deps.max_history),
        session,
        ducks: DuckTracker::new(),
        settings,
        settings_provider: deps.settings.clone(),
        cache: deps.cache,
        notifier: deps.notifier,
        sink,
        timing: deps.timing,
        control,
        internal_tx,
        pull: None,
        loading: None,
        idle_timer: None,
    };
    worker.arm_idle_timer();

    let task = tokio::spawn(worker.run(rx, internal_rx));
    info!("🎧 Worker iniciado para guild {}", guild_id);

    GuildHandle {
        guild_id,
        tx,
        resolver: deps.resolver,
        settings: deps.settings,
        task: Arc::new(parking_lot::Mutex::new(Some(task))),
    }
}

impl GuildWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<GuildCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(GuildCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => {
                        self.refresh_settings().await;
                        self.handle_command(command);
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
            }
            self.sync_control();
        }
        debug!("🎧 Worker de guild {} terminado", self.guild_id);
    }

    async fn refresh_settings(&mut self) {
        self.settings = self.settings_provider.guild_settings(self.guild_id).await;
        self.queue.set_max_size(self.settings.max_queue_size);
        self.session
            .set_duck(self.ducks.is_active() && self.settings.duck_enabled);
    }

    fn handle_command(&mut self, command: GuildCommand) {
        match command {
            GuildCommand::Enqueue { track, mode, reply } => {
                let result = self.queue.enqueue(track, mode);
                if result.is_ok() {
                    self.advance_if_idle();
                }
                let _ = reply.send(result);
            }
            GuildCommand::EnqueuePlaylist { tracks, reply } => {
                let requested = tracks.len();
                let added = self
                    .queue
                    .enqueue_playlist(tracks, self.settings.playlist_limit);
                let result = if requested > 0 && added == 0 {
                    Err(EngineError::QueueFull {
                        limit: self.settings.max_queue_size,
                    })
                } else {
                    self.advance_if_idle();
                    Ok(added)
                };
                let _ = reply.send(result);
            }
            GuildCommand::Remove { position, reply } => {
                let _ = reply.send(self.queue.remove(position));
            }
            GuildCommand::RemoveRange { range, reply } => {
                let _ = reply.send(self.queue.remove_range(range));
            }
            GuildCommand::Move { from, to, reply } => {
                let _ = reply.send(self.queue.move_track(from, to));
            }
            GuildCommand::Shuffle { reply } => {
                self.queue.shuffle();
                let _ = reply.send(());
            }
            GuildCommand::Clear { reply } => {
                let _ = reply.send(self.queue.clear());
            }
            GuildCommand::Page {
                page,
                page_size,
                reply,
            } => {
                let page_size = page_size.unwrap_or(self.settings.queue_page_size);
                let result = self.queue.page(page, page_size).map(|mut view| {
                    if let Some(current) = self.session.current() {
                        view.total_duration += current.playable_duration();
                    }
                    view
                });
                let _ = reply.send(result);
            }
            GuildCommand::NowPlaying { reply } => {
                let _ = reply.send(self.session.now_playing());
            }
            GuildCommand::History { reply } => {
                let _ = reply.send(self.queue.history().cloned().collect());
            }
            GuildCommand::Pause { reply } => {
                let _ = reply.send(self.session.pause());
            }
            GuildCommand::Resume { reply } => {
                let _ = reply.send(self.session.resume());
            }
            GuildCommand::Seek { position_ms, reply } => {
                let result = self.session.seek(position_ms).map(|restart| {
                    if let Some(start) = restart {
                        self.start_stream(start);
                    }
                });
                let _ = reply.send(result);
            }
            GuildCommand::FSeek { delta_ms, reply } => {
                let result = self.session.fseek(delta_ms).map(|restart| {
                    if let Some(start) = restart {
                        self.start_stream(start);
                    }
                });
                let _ = reply.send(result);
            }
            GuildCommand::Skip { count, reply } => {
                let result = self.session.skip(count, &mut self.queue);
                let _ = reply.send(result.map(|step| self.apply(step)));
            }
            GuildCommand::Unskip { reply } => {
                let result = self.session.unskip(&mut self.queue);
                let _ = reply.send(result.map(|step| self.apply(step)));
            }
            GuildCommand::Stop { reply } => {
                self.stop_stream();
                self.abort_loading();
                let cleared = self.session.stop(&mut self.queue);
                self.arm_idle_timer();
                let _ = reply.send(cleared);
            }
            GuildCommand::SetVolume { volume, reply } => {
                let _ = reply.send(self.session.set_volume(volume));
            }
            GuildCommand::SetLoop { mode, reply } => {
                self.session.set_loop_mode(mode);
                info!("🔁 Guild {}: loop {:?}", self.guild_id, mode);
                let _ = reply.send(());
            }
            GuildCommand::VoiceActivity { user_id, speaking } => {
                let anyone = self.ducks.update(user_id, speaking);
                if self.session.set_duck(anyone && self.settings.duck_enabled) {
                    debug!(
                        "🔉 Guild {}: ducking {}",
                        self.guild_id,
                        if self.session.duck_active() { "on" } else { "off" }
                    );
                }
            }
            GuildCommand::TrackEnded => {
                let generation = self.session.generation();
                self.stop_stream();
                self.finish_track(generation);
            }
            GuildCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Loaded { generation, result } => match result {
                Ok(handle) => {
                    if let Some(start) = self.session.on_loaded(generation, handle) {
                        if let Some(track) = self.session.current().cloned() {
                            self.notifier.emit(EngineEvent::TrackStarted {
                                guild_id: self.guild_id,
                                track,
                                announce: self.settings.auto_announce,
                            });
                        }
                        self.start_stream(start);
                    }
                }
                Err(error) => {
                    let step = self.session.on_load_failed(generation, &error, &mut self.queue);
                    self.apply(step);
                }
            },
            Internal::StreamExited { generation, exit } => {
                if generation != self.session.generation() {
                    return;
                }
                self.pull = None;
                match exit {
                    StreamExit::Finished => self.finish_track(generation),
                    StreamExit::SinkClosed => {
                        warn!("🔌 Guild {}: sink cerrado, sesión en pausa", self.guild_id);
                        self.session.halt(&mut self.queue);
                        self.arm_idle_timer();
                    }
                    StreamExit::Failed(message) => {
                        if let Some(key) = self.session.current().map(|t| t.source_key().clone()) {
                            // el artefacto no se pudo leer; forzar un fetch nuevo
                            let _ = self.cache.invalidate(&key);
                        }
                        let error = FetchError::transient(message);
                        let step = self
                            .session
                            .on_stream_failed(generation, &error, &mut self.queue);
                        self.apply(step);
                    }
                    StreamExit::Cancelled => {}
                }
            }
            Internal::IdleElapsed => {
                self.idle_timer = None;
                if self.session.is_idle() && self.queue.is_empty() {
                    info!("💤 Guild {} inactivo", self.guild_id);
                    self.notifier.emit(EngineEvent::IdleTimeout {
                        guild_id: self.guild_id,
                    });
                }
            }
        }
    }

    fn finish_track(&mut self, generation: u64) {
        let finished = self.session.current().cloned();
        let step = self.session.on_track_end(generation, &mut self.queue);
        if step == Step::Nothing {
            return;
        }
        if let Some(track) = finished {
            self.notifier.emit(EngineEvent::TrackEnded {
                guild_id: self.guild_id,
                track,
            });
        }
        self.apply(step);
    }

    fn advance_if_idle(&mut self) {
        if self.session.is_idle() {
            let step = self.session.advance(&mut self.queue);
            self.apply(step);
        }
    }

    fn apply(&mut self, step: Step) {
        match step {
            Step::Nothing => {}
            Step::Load(request) => {
                self.stop_stream();
                self.cancel_idle_timer();

                let cache = self.cache.clone();
                let tx = self.internal_tx.clone();
                let key = request.track.source_key().clone();
                let generation = request.generation;
                let task = tokio::spawn(async move {
                    let result = cache.acquire(&key).await;
                    let _ = tx.send(Internal::Loaded { generation, result });
                });
                if let Some(previous) = self.loading.replace(task) {
                    previous.abort();
                }
            }
            Step::Stalled(skipped) => {
                self.stop_stream();
                warn!(
                    "🛑 Guild {}: cola detenida tras {} fallos",
                    self.guild_id,
                    skipped.len()
                );
                self.notifier.emit(EngineEvent::QueueStalled {
                    guild_id: self.guild_id,
                    skipped,
                });
                self.arm_idle_timer();
            }
            Step::Exhausted(skipped) => {
                self.stop_stream();
                info!(
                    "📭 Guild {}: cola terminada ({} fallidos)",
                    self.guild_id,
                    skipped.len()
                );
                self.notifier.emit(EngineEvent::QueueExhausted {
                    guild_id: self.guild_id,
                    skipped,
                });
                self.arm_idle_timer();
            }
        }
    }

    fn start_stream(&mut self, start: StreamStart) {
        self.stop_stream();
        self.sync_control();

        let generation = start.generation;
        let tx = self.internal_tx.clone();
        self.pull = Some(PullLoop::spawn(
            start,
            self.sink.clone(),
            self.control.subscribe(),
            self.timing,
            move |exit| {
                let _ = tx.send(Internal::StreamExited { generation, exit });
            },
        ));
    }

    fn stop_stream(&mut self) {
        if let Some(pull) = self.pull.take() {
            pull.stop();
        }
    }

    fn abort_loading(&mut self) {
        if let Some(task) = self.loading.take() {
            task.abort();
        }
    }

    fn sync_control(&self) {
        let control = self.session.control(self.settings.duck_volume);
        self.control.send_if_modified(|current| {
            if *current == control {
                false
            } else {
                *current = control;
                true
            }
        });
    }

    fn arm_idle_timer(&mut self) {
        self.cancel_idle_timer();
        if self.settings.idle_disconnect_secs == 0 {
            return;
        }
        let delay = Duration::from_secs(self.settings.idle_disconnect_secs);
        let tx = self.internal_tx.clone();
        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::IdleElapsed);
        }));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn shutdown(&mut self) {
        self.stop_stream();
        self.abort_loading();
        self.cancel_idle_timer();
        self.session.stop(&mut self.queue);
        self.ducks.clear();
    }
}

/// Handle clonable para enviar comandos al worker de un servidor.
///
/// Every method resolves once the worker has applied the command, so effects
/// are observed in the order the calls were made.
#[derive(Clone)]
pub struct GuildHandle {
    guild_id: GuildId,
    tx: mpsc::Sender<GuildCommand>,
    resolver: Arc<dyn Resolver>,
    settings: Arc<dyn SettingsProvider>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl GuildHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> GuildCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EngineError::SessionClosed)?;
        rx.await.map_err(|_| EngineError::SessionClosed)
    }

    async fn notify(&self, command: GuildCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::SessionClosed)
    }

    /// Resuelve una búsqueda/URL y la agrega a la cola.
    ///
    /// Resolution runs on the caller's task, so a slow resolver never blocks
    /// the guild's other commands.
    pub async fn play(&self, query: &str, added_by: UserId, mode: EnqueueMode) -> Result<Track> {
        let descriptor = self.resolver.resolve(query).await?;
        let track = Track::from_descriptor(&descriptor, added_by)?;
        self.enqueue(track.clone(), mode).await?;
        Ok(track)
    }

    /// Igual que [`play`](Self::play) pero agrega un track por capítulo
    pub async fn play_chapters(&self, query: &str, added_by: UserId) -> Result<usize> {
        let descriptor = self.resolver.resolve(query).await?;
        let tracks = Track::chapters_from_descriptor(&descriptor, added_by)?;
        self.enqueue_playlist(tracks).await
    }

    /// Agrega una playlist completa, hasta `playlist_limit` del servidor
    pub async fn play_playlist(&self, url: &str, added_by: UserId) -> Result<usize> {
        let limit = self.settings.guild_settings(self.guild_id).await.playlist_limit;
        let descriptors = self.resolver.resolve_playlist(url, limit).await?;
        let tracks = descriptors
            .iter()
            .filter_map(|d| match Track::from_descriptor(d, added_by) {
                Ok(track) => Some(track),
                Err(e) => {
                    debug!("Entrada de playlist descartada: {}", e);
                    None
                }
            })
            .collect();
        self.enqueue_playlist(tracks).await
    }

    pub async fn enqueue(&self, track: Track, mode: EnqueueMode) -> Result<usize> {
        self.request(|reply| GuildCommand::Enqueue { track, mode, reply })
            .await?
    }

    pub async fn enqueue_playlist(&self, tracks: Vec<Track>) -> Result<usize> {
        self.request(|reply| GuildCommand::EnqueuePlaylist { tracks, reply })
            .await?
    }

    pub async fn remove(&self, position: usize) -> Result<Track> {
        self.request(|reply| GuildCommand::Remove { position, reply })
            .await?
    }

    pub async fn remove_range(&self, range: Range<usize>) -> Result<Vec<Track>> {
        self.request(|reply| GuildCommand::RemoveRange { range, reply })
            .await?
    }

    pub async fn move_track(&self, from: usize, to: usize) -> Result<()> {
        self.request(|reply| GuildCommand::Move { from, to, reply })
            .await?
    }

    pub async fn shuffle(&self) -> Result<()> {
        self.request(|reply| GuildCommand::Shuffle { reply }).await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.request(|reply| GuildCommand::Clear { reply }).await
    }

    /// `page_size = None` usa `queue_page_size` del servidor
    pub async fn page(&self, page: usize, page_size: Option<usize>) -> Result<QueuePage> {
        self.request(|reply| GuildCommand::Page {
            page,
            page_size,
            reply,
        })
        .await?
    }

    pub async fn now_playing(&self) -> Result<Option<NowPlaying>> {
        self.request(|reply| GuildCommand::NowPlaying { reply })
            .await
    }

    /// Historial, el más reciente al final
    pub async fn history(&self) -> Result<Vec<Track>> {
        self.request(|reply| GuildCommand::History { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| GuildCommand::Pause { reply }).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| GuildCommand::Resume { reply }).await?
    }

    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        self.request(|reply| GuildCommand::Seek { position_ms, reply })
            .await?
    }

    pub async fn fseek(&self, delta_ms: i64) -> Result<()> {
        self.request(|reply| GuildCommand::FSeek { delta_ms, reply })
            .await?
    }

    pub async fn skip(&self, count: usize) -> Result<()> {
        self.request(|reply| GuildCommand::Skip { count, reply })
            .await?
    }

    pub async fn unskip(&self) -> Result<()> {
        self.request(|reply| GuildCommand::Unskip { reply }).await?
    }

    /// Detiene la reproducción y vacía cola e historial
    pub async fn stop(&self) -> Result<usize> {
        self.request(|reply| GuildCommand::Stop { reply }).await
    }

    pub async fn set_volume(&self, volume: u8) -> Result<()> {
        self.request(|reply| GuildCommand::SetVolume { volume, reply })
            .await?
    }

    pub async fn set_loop(&self, mode: LoopMode) -> Result<()> {
        self.request(|reply| GuildCommand::SetLoop { mode, reply })
            .await
    }

    /// Evento de actividad de voz (inicio/fin de habla de un usuario)
    pub async fn voice_activity(&self, user_id: UserId, speaking: bool) -> Result<()> {
        self.notify(GuildCommand::VoiceActivity { user_id, speaking })
            .await
    }

    /// Para sinks con reloj propio: el track actual terminó
    pub async fn notify_track_end(&self) -> Result<()> {
        self.notify(GuildCommand::TrackEnded).await
    }

    /// Detiene el worker y espera a que termine
    pub(crate) async fn shutdown(&self) {
        let _ = self.request(|reply| GuildCommand::Shutdown { reply }).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for GuildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuildHandle")
            .field("guild_id", &self.guild_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, SourceKey};
    use crate::error::ResolutionError;
    use crate::events::{self, EventStream};
    use crate::sources::{Chapter, MockResolver, SourceDescriptor};
    use crate::test_support::{MemoryFetcher, RecordingSink};
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(5);

    fn key(name: &str) -> SourceKey {
        SourceKey::from_canonical(format!("test:{name}"))
    }

    fn descriptor(name: &str, duration_ms: u64) -> SourceDescriptor {
        SourceDescriptor {
            source_key: key(name),
            title: name.to_string(),
            duration_ms,
            chapters: Vec::new(),
        }
    }

    fn track(name: &str, duration_ms: u64) -> Track {
        Track::from_descriptor(&descriptor(name, duration_ms), UserId::new(1)).unwrap()
    }

    fn settings() -> GuildSettings {
        GuildSettings {
            default_volume: 80,
            duck_volume: 10,
            idle_disconnect_secs: 0,
            ..GuildSettings::default()
        }
    }

    struct Fixture {
        handle: GuildHandle,
        sink: Arc<RecordingSink>,
        events: EventStream,
        cache: AudioCache,
        _dir: tempfile::TempDir,
    }

    /// Ajustes que el test puede cambiar entre comandos
    struct SwitchableSettings(parking_lot::Mutex<GuildSettings>);

    #[async_trait::async_trait]
    impl SettingsProvider for SwitchableSettings {
        async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
            GuildSettings {
                guild_id: guild_id.get(),
                ..self.0.lock().clone()
            }
        }
    }

    async fn fixture(resolver: MockResolver, settings: GuildSettings) -> Fixture {
        fixture_with(resolver, Arc::new(settings)).await
    }

    async fn fixture_with(
        resolver: MockResolver,
        settings: Arc<dyn SettingsProvider>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = MemoryFetcher::new();
        for name in ["a", "b", "c", "long", "album"] {
            fetcher = fetcher.with_source(&key(name), 4096);
        }
        let (notifier, events) = events::channel(64);
        let cache = AudioCache::new(
            CacheSettings {
                dir: dir.path().join("cache"),
                ceiling_bytes: 1 << 20,
                fetch_timeout: WAIT,
                failed_cooldown: Duration::from_secs(60),
            },
            Arc::new(fetcher),
            notifier.clone(),
        )
        .unwrap();

        let sink = Arc::new(RecordingSink::new());
        let handle = spawn(
            GuildId::new(42),
            sink.clone(),
            WorkerDeps {
                cache: cache.clone(),
                settings,
                resolver: Arc::new(resolver),
                notifier,
                timing: StreamTiming {
                    frame: Duration::from_millis(5),
                    backpressure_retry: Duration::from_millis(5),
                },
                max_history: 10,
                max_consecutive_failures: 3,
            },
        )
        .await;

        Fixture {
            handle,
            sink,
            events,
            cache,
            _dir: dir,
        }
    }

    async fn wait_for(events: &EventStream, mut predicate: impl FnMut(&EngineEvent) -> bool) {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return;
                }
            }
        })
        .await
        .expect("timed out waiting for event");
    }

    fn started(name: &'static str) -> impl FnMut(&EngineEvent) -> bool {
        move |event| {
            matches!(event, EngineEvent::TrackStarted { track, .. } if track.title() == name)
        }
    }

    #[tokio::test]
    async fn play_resolves_then_streams_to_the_end() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .withf(|query| query == "song a")
            .times(1)
            .returning(|_| Ok(descriptor("a", 50)));
        let fx = fixture(resolver, settings()).await;

        let queued = fx
            .handle
            .play("song a", UserId::new(3), EnqueueMode::Append)
            .await
            .unwrap();
        assert_eq!(queued.title(), "a");
        assert_eq!(queued.added_by(), UserId::new(3));

        wait_for(&fx.events, started("a")).await;
        wait_for(&fx.events, |e| matches!(e, EngineEvent::TrackEnded { .. })).await;
        wait_for(&fx.events, |e| matches!(e, EngineEvent::QueueExhausted { .. })).await;

        let frames = fx.sink.frames();
        assert!(!frames.is_empty());
        let bytes: usize = frames.iter().map(|f| f.data.len()).sum();
        assert_eq!(bytes, 4096);
        assert_eq!(fx.cache.ref_count(&key("a")), Some(0));
    }

    #[tokio::test]
    async fn play_surfaces_resolution_errors() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve()
            .returning(|_| Err(ResolutionError::RateLimited));
        let fx = fixture(resolver, settings()).await;

        let result = fx
            .handle
            .play("anything", UserId::new(3), EnqueueMode::Append)
            .await;
        assert!(matches!(
            result,
            Err(EngineError::Resolution(ResolutionError::RateLimited))
        ));
        assert_eq!(fx.handle.page(0, None).await.unwrap().total_items, 0);
    }

    #[tokio::test]
    async fn play_playlist_asks_for_the_guild_limit() {
        let mut resolver = MockResolver::new();
        resolver
            .expect_resolve_playlist()
            .withf(|_, limit| *limit == 2)
            .returning(|_, _| Ok(vec![descriptor("long", 60_000), descriptor("b", 60_000)]));
        let fx = fixture(
            resolver,
            GuildSettings {
                playlist_limit: 2,
                ..settings()
            },
        )
        .await;

        let added = fx
            .handle
            .play_playlist("https://example.com/list", UserId::new(3))
            .await
            .unwrap();
        assert_eq!(added, 2);

        wait_for(&fx.events, started("long")).await;
        let page = fx.handle.page(0, None).await.unwrap();
        assert_eq!(page.total_items, 1);
        assert_eq!(page.items[0].1.title(), "b");
    }

    #[tokio::test]
    async fn play_chapters_queues_each_chapter() {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().returning(|_| {
            Ok(SourceDescriptor {
                chapters: vec![
                    Chapter {
                        title: "Intro".into(),
                        start_ms: 0,
                        end_ms: 30_000,
                    },
                    Chapter {
                        title: "Outro".into(),
                        start_ms: 30_000,
                        end_ms: 60_000,
                    },
                ],
                ..descriptor("album", 60_000)
            })
        });
        let fx = fixture(resolver, settings()).await;

        let added = fx.handle.play_chapters("album", UserId::new(3)).await.unwrap();
        assert_eq!(added, 2);

        wait_for(&fx.events, started("album - Intro")).await;
        let now = fx.handle.now_playing().await.unwrap().unwrap();
        assert_eq!(now.track.playable_ms(), 30_000);
        let page = fx.handle.page(0, None).await.unwrap();
        assert_eq!(page.items[0].1.title(), "album - Outro");
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let fx = fixture(
            MockResolver::new(),
            GuildSettings {
                max_queue_size: 1,
                ..settings()
            },
        )
        .await;

        // el primero pasa directo a reproducción
        fx.handle.enqueue(track("long", 60_000), EnqueueMode::Append).await.unwrap();
        fx.handle.enqueue(track("b", 60_000), EnqueueMode::Append).await.unwrap();
        let result = fx.handle.enqueue(track("c", 60_000), EnqueueMode::Append).await;
        assert!(matches!(result, Err(EngineError::QueueFull { limit: 1 })));

        let result = fx.handle.enqueue_playlist(vec![track("c", 60_000)]).await;
        assert!(matches!(result, Err(EngineError::QueueFull { .. })));
    }

    #[tokio::test]
    async fn voice_activity_ducks_stream_volume() {
        let fx = fixture(MockResolver::new(), settings()).await;
        fx.handle.enqueue(track("long", 60_000), EnqueueMode::Append).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.handle.voice_activity(UserId::new(9), true).await.unwrap();
        let now = fx.handle.now_playing().await.unwrap().unwrap();
        assert!(now.duck_active);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.sink.frames().last().map(|f| f.volume), Some(10));

        fx.handle.voice_activity(UserId::new(9), false).await.unwrap();
        let now = fx.handle.now_playing().await.unwrap().unwrap();
        assert!(!now.duck_active);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.sink.frames().last().map(|f| f.volume), Some(80));
    }

    #[tokio::test]
    async fn ducking_disabled_ignores_voice_activity() {
        let fx = fixture(
            MockResolver::new(),
            GuildSettings {
                duck_enabled: false,
                ..settings()
            },
        )
        .await;
        fx.handle.enqueue(track("long", 60_000), EnqueueMode::Append).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.handle.voice_activity(UserId::new(9), true).await.unwrap();
        let now = fx.handle.now_playing().await.unwrap().unwrap();
        assert!(!now.duck_active);
    }

    #[tokio::test]
    async fn reenabling_ducking_applies_to_current_speakers() {
        let provider = Arc::new(SwitchableSettings(parking_lot::Mutex::new(GuildSettings {
            duck_enabled: false,
            ..settings()
        })));
        let fx = fixture_with(MockResolver::new(), provider.clone()).await;
        fx.handle.enqueue(track("long", 60_000), EnqueueMode::Append).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.handle.voice_activity(UserId::new(9), true).await.unwrap();
        assert!(!fx.handle.now_playing().await.unwrap().unwrap().duck_active);

        provider.0.lock().duck_enabled = true;
        assert!(fx.handle.now_playing().await.unwrap().unwrap().duck_active);

        provider.0.lock().duck_enabled = false;
        assert!(!fx.handle.now_playing().await.unwrap().unwrap().duck_active);
    }

    #[tokio::test]
    async fn exhaustion_reports_tracks_that_failed_to_load() {
        let fx = fixture(MockResolver::new(), settings()).await;
        fx.handle.enqueue(track("missing", 60_000), EnqueueMode::Append).await.unwrap();

        let exhausted = tokio::time::timeout(WAIT, async {
            loop {
                if let Some(EngineEvent::QueueExhausted { skipped, .. }) = fx.events.recv().await {
                    return skipped;
                }
            }
        })
        .await
        .unwrap();

        let titles: Vec<&str> = exhausted.iter().map(|t| t.title()).collect();
        assert_eq!(titles, vec!["missing"]);
        assert!(fx.handle.now_playing().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notify_track_end_moves_on() {
        let fx = fixture(MockResolver::new(), settings()).await;
        let tracks = vec![track("long", 60_000), track("b", 60_000)];
        fx.handle.enqueue_playlist(tracks).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.handle.notify_track_end().await.unwrap();
        wait_for(&fx.events, started("b")).await;

        let history = fx.handle.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title(), "long");
    }

    #[tokio::test]
    async fn seek_moves_the_stream_position() {
        let fx = fixture(MockResolver::new(), settings()).await;
        fx.handle.enqueue(track("long", 60_000), EnqueueMode::Append).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.handle.seek(30_000).await.unwrap();
        let now = fx.handle.now_playing().await.unwrap().unwrap();
        assert!(now.position_ms >= 30_000);
        assert!(now.remaining_ms <= 30_000);

        assert!(matches!(
            fx.handle.seek(90_000).await,
            Err(EngineError::OutOfRange { .. })
        ));

        fx.handle.fseek(-60_000).await.unwrap();
        let now = fx.handle.now_playing().await.unwrap().unwrap();
        assert!(now.position_ms < 30_000);
    }

    #[tokio::test]
    async fn closed_sink_halts_but_keeps_the_queue() {
        let fx = fixture(MockResolver::new(), settings()).await;
        let tracks = vec![track("long", 60_000), track("b", 60_000)];
        fx.handle.enqueue_playlist(tracks).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.sink.close();
        tokio::time::timeout(WAIT, async {
            while fx.handle.now_playing().await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let page = fx.handle.page(0, None).await.unwrap();
        let titles: Vec<&str> = page.items.iter().map(|(_, t)| t.title()).collect();
        assert_eq!(titles, vec!["long", "b"]);
        assert_eq!(fx.cache.ref_count(&key("long")), Some(0));
    }

    #[tokio::test]
    async fn stop_clears_everything() {
        let fx = fixture(MockResolver::new(), settings()).await;
        let tracks = vec![track("long", 60_000), track("b", 60_000), track("c", 60_000)];
        fx.handle.enqueue_playlist(tracks).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        assert_eq!(fx.handle.stop().await.unwrap(), 2);
        assert!(fx.handle.now_playing().await.unwrap().is_none());
        assert!(fx.handle.history().await.unwrap().is_empty());
        assert!(matches!(fx.handle.pause().await, Err(EngineError::NothingPlaying)));
        assert_eq!(fx.cache.ref_count(&key("long")), Some(0));
    }

    #[tokio::test]
    async fn idle_guild_reports_timeout() {
        let fx = fixture(
            MockResolver::new(),
            GuildSettings {
                idle_disconnect_secs: 1,
                ..settings()
            },
        )
        .await;

        wait_for(&fx.events, |e| matches!(e, EngineEvent::IdleTimeout { .. })).await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_handle() {
        let fx = fixture(MockResolver::new(), settings()).await;
        fx.handle.enqueue(track("long", 60_000), EnqueueMode::Append).await.unwrap();
        wait_for(&fx.events, started("long")).await;

        fx.handle.shutdown().await;
        assert!(fx.handle.is_closed());
        assert!(matches!(
            fx.handle.skip(1).await,
            Err(EngineError::SessionClosed)
        ));
        assert_eq!(fx.cache.ref_count(&key("long")), Some(0));
    }
}
