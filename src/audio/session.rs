use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info, warn};

use super::effects::{effective_volume, MAX_VOLUME};
use super::queue::{EnqueueMode, LoopMode, QueueManager};
use super::stream::{StreamControl, StreamStart};
use super::track::Track;
use crate::cache::ArtifactHandle;
use crate::error::{EngineError, FetchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
}

/// Pedido de carga al caché para el track actual
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub generation: u64,
    pub track: Track,
}

/// Lo que el worker debe hacer después de una transición
#[derive(Debug, PartialEq)]
pub enum Step {
    Nothing,
    Load(LoadRequest),
    /// Demasiados fallos seguidos; la sesión quedó idle
    Stalled(Vec<Track>),
    /// La cola se vació; la sesión quedó idle. Lleva los tracks que fallaron
    /// al cargar desde el último éxito
    Exhausted(Vec<Track>),
}

/// Vista de "now playing"
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track: Track,
    pub position_ms: u64,
    pub remaining_ms: u64,
    pub state: PlaybackState,
    pub volume: u8,
    pub loop_mode: LoopMode,
    pub duck_active: bool,
}

/// Máquina de estados de reproducción de un servidor.
///
/// Owned by the guild worker and never shared, so it takes the queue by `&mut`
/// on each transition instead of holding it. Every load and every stream
/// carries the `generation` it was started under; results from an older
/// generation are ignored.
#[derive(Debug)]
pub struct PlaybackSession {
    state: PlaybackState,
    current: Option<Track>,
    artifact: Option<ArtifactHandle>,
    position: Arc<AtomicU64>,
    /// Offset pedido antes de que termine la carga
    start_offset_ms: u64,
    volume: u8,
    loop_mode: LoopMode,
    duck_active: bool,
    generation: u64,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    skip_report: Vec<Track>,
}

impl PlaybackSession {
    pub fn new(volume: u8, max_consecutive_failures: u32) -> Self {
        Self {
            state: PlaybackState::Idle,
            current: None,
            artifact: None,
            position: Arc::new(AtomicU64::new(0)),
            start_offset_ms: 0,
            volume: volume.min(MAX_VOLUME),
            loop_mode: LoopMode::Off,
            duck_active: false,
            generation: 0,
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
            skip_report: Vec::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn position_ms(&self) -> u64 {
        match self.state {
            PlaybackState::Loading => self.start_offset_ms,
            _ => self.position.load(Ordering::Relaxed),
        }
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn duck_active(&self) -> bool {
        self.duck_active
    }

    pub fn is_idle(&self) -> bool {
        self.state == PlaybackState::Idle
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        let track = self.current.clone()?;
        let position_ms = self.position_ms().min(track.playable_ms());
        Some(NowPlaying {
            remaining_ms: track.playable_ms() - position_ms,
            track,
            position_ms,
            state: self.state,
            volume: self.volume,
            loop_mode: self.loop_mode,
            duck_active: self.duck_active,
        })
    }

    /// Lo que el pull loop debe aplicar ahora mismo
    pub fn control(&self, duck_volume: u8) -> StreamControl {
        StreamControl {
            paused: self.state != PlaybackState::Playing,
            volume: effective_volume(self.volume, self.duck_active, duck_volume),
        }
    }

    /// Empieza a reproducir si la sesión está idle y hay algo en cola
    pub fn advance(&mut self, queue: &mut QueueManager) -> Step {
        if self.state != PlaybackState::Idle || queue.is_empty() {
            return Step::Nothing;
        }
        self.begin_next(queue)
    }

    /// Fin natural del track en reproducción
    pub fn on_track_end(&mut self, generation: u64, queue: &mut QueueManager) -> Step {
        if generation != self.generation
            || !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused)
        {
            debug!("Fin de track obsoleto (#{}), ignorado", generation);
            return Step::Nothing;
        }

        self.artifact = None;
        let Some(finished) = self.current.take() else {
            return self.go_idle();
        };

        if self.loop_mode == LoopMode::Track {
            return self.load(finished);
        }

        self.retire(finished, queue);
        self.begin_next(queue)
    }

    /// Salta `count` tracks: el actual más `count - 1` de la cola
    pub fn skip(&mut self, count: usize, queue: &mut QueueManager) -> Result<Step> {
        if count == 0 {
            return Err(EngineError::out_of_range(0u64, queue.len() + 1));
        }
        let finished = self.current.take().ok_or(EngineError::NothingPlaying)?;
        self.artifact = None;

        info!("⏭️ Saltando {} track(s) desde '{}'", count, finished.title());
        self.retire(finished, queue);
        for _ in 1..count {
            match queue.pop_next() {
                Some(track) => self.retire(track, queue),
                None => break,
            }
        }

        Ok(self.begin_next(queue))
    }

    /// Vuelve al último track del historial; el actual pasa al frente de la cola
    pub fn unskip(&mut self, queue: &mut QueueManager) -> Result<Step> {
        let previous = queue.pop_history().ok_or(EngineError::HistoryEmpty)?;
        self.artifact = None;

        if let Some(current) = self.current.take() {
            queue.requeue(current, EnqueueMode::Front);
        }

        if self.loop_mode == LoopMode::Queue {
            // `retire` también lo re-encoló al final; no duplicarlo
            queue.remove_last_copy(&previous);
        }

        info!("⏮️ Volviendo a '{}'", previous.title());
        Ok(self.load(previous))
    }

    /// Resultado exitoso de la carga; devuelve qué transmitir
    pub fn on_loaded(&mut self, generation: u64, handle: ArtifactHandle) -> Option<StreamStart> {
        if generation != self.generation || self.state != PlaybackState::Loading {
            // soltar el handle libera la entrada
            debug!("Carga obsoleta (#{}) descartada", generation);
            return None;
        }
        let track = self.current.as_ref()?;

        self.consecutive_failures = 0;
        self.skip_report.clear();
        self.state = PlaybackState::Playing;

        let start = StreamStart {
            generation,
            path: handle.path().to_path_buf(),
            size_bytes: handle.size_bytes(),
            source_duration_ms: track.duration_ms(),
            start_ms: track.start_ms(),
            end_ms: track.end_ms(),
            offset_ms: self.start_offset_ms,
            position: self.position.clone(),
        };
        self.position.store(self.start_offset_ms, Ordering::Relaxed);
        self.start_offset_ms = 0;
        self.artifact = Some(handle);

        info!("▶️ Reproduciendo: {}", track.title());
        Some(start)
    }

    pub fn on_load_failed(
        &mut self,
        generation: u64,
        error: &FetchError,
        queue: &mut QueueManager,
    ) -> Step {
        if generation != self.generation || self.state != PlaybackState::Loading {
            return Step::Nothing;
        }

        let Some(failed) = self.current.take() else {
            return self.go_idle();
        };
        warn!("❌ No se pudo cargar '{}': {}", failed.title(), error);

        self.consecutive_failures += 1;
        self.skip_report.push(failed);

        if self.consecutive_failures >= self.max_consecutive_failures {
            warn!(
                "🛑 {} fallos consecutivos, deteniendo la cola",
                self.consecutive_failures
            );
            let skipped = std::mem::take(&mut self.skip_report);
            self.go_idle();
            return Step::Stalled(skipped);
        }

        self.begin_next(queue)
    }

    /// El pull loop no pudo leer el artefacto; se trata como un fallo de carga
    pub fn on_stream_failed(
        &mut self,
        generation: u64,
        error: &FetchError,
        queue: &mut QueueManager,
    ) -> Step {
        if generation != self.generation
            || !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused)
        {
            return Step::Nothing;
        }
        self.artifact = None;
        self.state = PlaybackState::Loading;
        self.on_load_failed(generation, error, queue)
    }

    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Playing => {
                self.state = PlaybackState::Paused;
                info!("⏸️ Pausado en {}ms", self.position_ms());
                Ok(())
            }
            PlaybackState::Paused => Err(EngineError::InvalidState("already paused")),
            PlaybackState::Loading => Err(EngineError::InvalidState("track is still loading")),
            PlaybackState::Idle => Err(EngineError::NothingPlaying),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            PlaybackState::Paused => {
                self.state = PlaybackState::Playing;
                info!("▶️ Reanudado en {}ms", self.position_ms());
                Ok(())
            }
            PlaybackState::Playing => Err(EngineError::InvalidState("not paused")),
            PlaybackState::Loading => Err(EngineError::InvalidState("track is still loading")),
            PlaybackState::Idle => Err(EngineError::NothingPlaying),
        }
    }

    /// Reposiciona dentro del track actual.
    ///
    /// While playing the current stream has to be restarted from the returned
    /// [`StreamStart`]; while loading the offset is applied once the load
    /// completes and `None` is returned.
    pub fn seek(&mut self, position_ms: u64) -> Result<Option<StreamStart>> {
        let track = self.current.as_ref().ok_or(EngineError::NothingPlaying)?;
        let limit = track.playable_ms();
        if position_ms > limit {
            return Err(EngineError::out_of_range(position_ms, limit));
        }

        match self.state {
            PlaybackState::Loading => {
                self.start_offset_ms = position_ms;
                Ok(None)
            }
            PlaybackState::Playing | PlaybackState::Paused => {
                let Some(handle) = self.artifact.as_ref() else {
                    return Err(EngineError::InvalidState("no artifact for current track"));
                };
                self.generation += 1;
                self.position.store(position_ms, Ordering::Relaxed);
                debug!("⏩ Seek a {}ms (#{})", position_ms, self.generation);
                Ok(Some(StreamStart {
                    generation: self.generation,
                    path: handle.path().to_path_buf(),
                    size_bytes: handle.size_bytes(),
                    source_duration_ms: track.duration_ms(),
                    start_ms: track.start_ms(),
                    end_ms: track.end_ms(),
                    offset_ms: position_ms,
                    position: self.position.clone(),
                }))
            }
            PlaybackState::Idle => Err(EngineError::NothingPlaying),
        }
    }

    /// Seek relativo; un resultado negativo se recorta a 0
    pub fn fseek(&mut self, delta_ms: i64) -> Result<Option<StreamStart>> {
        if self.current.is_none() {
            return Err(EngineError::NothingPlaying);
        }
        let target = (self.position_ms() as i64).saturating_add(delta_ms).max(0) as u64;
        self.seek(target)
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<()> {
        if volume > MAX_VOLUME {
            return Err(EngineError::out_of_range(volume, MAX_VOLUME));
        }
        self.volume = volume;
        Ok(())
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    /// Devuelve `true` si el estado de ducking cambió
    pub fn set_duck(&mut self, active: bool) -> bool {
        let changed = self.duck_active != active;
        self.duck_active = active;
        changed
    }

    /// Detiene todo: cola, historial y track actual
    pub fn stop(&mut self, queue: &mut QueueManager) -> usize {
        let cleared = queue.clear();
        queue.clear_history();
        self.go_idle();
        info!("⏹️ Reproducción detenida ({} tracks descartados)", cleared);
        cleared
    }

    /// Deja la sesión idle conservando la cola (p. ej. el sink se cerró)
    pub fn halt(&mut self, queue: &mut QueueManager) {
        if let Some(current) = self.current.take() {
            queue.requeue(current, EnqueueMode::Front);
        }
        self.go_idle();
    }

    fn retire(&mut self, track: Track, queue: &mut QueueManager) {
        queue.push_history(track.clone());
        if self.loop_mode == LoopMode::Queue {
            queue.requeue(track, EnqueueMode::Append);
        }
    }

    fn begin_next(&mut self, queue: &mut QueueManager) -> Step {
        match queue.pop_next() {
            Some(track) => self.load(track),
            None => {
                let skipped = std::mem::take(&mut self.skip_report);
                self.go_idle();
                Step::Exhausted(skipped)
            }
        }
    }

    fn load(&mut self, track: Track) -> Step {
        self.generation += 1;
        self.state = PlaybackState::Loading;
        self.artifact = None;
        self.start_offset_ms = 0;
        self.position.store(0, Ordering::Relaxed);
        self.current = Some(track.clone());
        debug!("⏳ Cargando '{}' (#{})", track.title(), self.generation);
        Step::Load(LoadRequest {
            generation: self.generation,
            track,
        })
    }

    fn go_idle(&mut self) -> Step {
        self.generation += 1;
        self.state = PlaybackState::Idle;
        self.current = None;
        self.artifact = None;
        self.start_offset_ms = 0;
        self.position.store(0, Ordering::Relaxed);
        self.consecutive_failures = 0;
        self.skip_report.clear();
        Step::Nothing
    }
}
