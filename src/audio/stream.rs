use std::{
    io::SeekFrom,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    sync::watch,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SinkError;
use crate::sources::{Frame, Sink};

/// Estado que el pull loop consulta en cada frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamControl {
    pub paused: bool,
    /// Volumen efectivo (ducking ya aplicado)
    pub volume: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    pub frame: Duration,
    pub backpressure_retry: Duration,
}

impl StreamTiming {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame: Duration::from_millis(config.frame_duration_ms),
            backpressure_retry: Duration::from_millis(config.backpressure_retry_ms),
        }
    }
}

/// Qué leer del artefacto y desde dónde
#[derive(Debug, Clone)]
pub struct StreamStart {
    pub generation: u64,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Duración de la fuente completa (mapea bytes a tiempo)
    pub source_duration_ms: u64,
    /// Ventana absoluta reproducible `[start_ms, end_ms)`
    pub start_ms: u64,
    pub end_ms: u64,
    /// Posición inicial relativa a `start_ms`
    pub offset_ms: u64,
    pub position: Arc<AtomicU64>,
}

impl StreamStart {
    fn playable_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Byte del artefacto correspondiente a `ms` absolutos
    fn byte_at(&self, ms: u64) -> u64 {
        if self.source_duration_ms == 0 {
            return 0;
        }
        let byte = self.size_bytes as u128 * ms.min(self.source_duration_ms) as u128
            / self.source_duration_ms as u128;
        byte as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamExit {
    /// Fin natural del track
    Finished,
    Cancelled,
    SinkClosed,
    /// Error leyendo el artefacto
    Failed(String),
}

/// Tarea que lee el artefacto en cache y entrega frames al sink, a ritmo.
///
/// Dropping the handle cancels the task.
pub struct PullLoop {
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl PullLoop {
    pub fn spawn<F>(
        start: StreamStart,
        sink: Arc<dyn Sink>,
        control: watch::Receiver<StreamControl>,
        timing: StreamTiming,
        on_exit: F,
    ) -> Self
    where
        F: FnOnce(StreamExit) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let generation = start.generation;

        let task = tokio::spawn(async move {
            let exit = run(start, sink, control, timing, token).await;
            debug!("⏹️ Pull loop #{} terminó: {:?}", generation, exit);
            if exit != StreamExit::Cancelled {
                on_exit(exit);
            }
        });

        Self {
            cancel,
            _task: task,
        }
    }

    pub fn stop(self) {
        self.cancel.cancel();
    }
}

impl Drop for PullLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    start: StreamStart,
    sink: Arc<dyn Sink>,
    mut control: watch::Receiver<StreamControl>,
    timing: StreamTiming,
    cancel: CancellationToken,
) -> StreamExit {
    let playable = start.playable_ms();
    let frame_ms = (timing.frame.as_millis() as u64).max(1);
    let mut pos_ms = start.offset_ms.min(playable);
    start.position.store(pos_ms, Ordering::Relaxed);

    let mut file = match tokio::fs::File::open(&start.path).await {
        Ok(file) => file,
        Err(e) => return StreamExit::Failed(format!("{}: {}", start.path.display(), e)),
    };
    if let Err(e) = file
        .seek(SeekFrom::Start(start.byte_at(start.start_ms + pos_ms)))
        .await
    {
        return StreamExit::Failed(e.to_string());
    }

    let mut ticker = tokio::time::interval(timing.frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while pos_ms < playable {
        tokio::select! {
            _ = cancel.cancelled() => return StreamExit::Cancelled,
            _ = ticker.tick() => {}
        }

        let ctl = *control.borrow_and_update();
        if ctl.paused {
            tokio::select! {
                _ = cancel.cancelled() => return StreamExit::Cancelled,
                changed = control.changed() => {
                    if changed.is_err() {
                        return StreamExit::Cancelled;
                    }
                }
            }
            ticker.reset();
            continue;
        }

        let next_ms = (pos_ms + frame_ms).min(playable);
        let from = start.byte_at(start.start_ms + pos_ms);
        let to = start.byte_at(start.start_ms + next_ms);

        let mut data = Vec::with_capacity((to - from) as usize);
        if let Err(e) = (&mut file).take(to - from).read_to_end(&mut data).await {
            return StreamExit::Failed(e.to_string());
        }
        if data.is_empty() && to > from {
            // artefacto más corto de lo esperado
            warn!("📉 {} terminó antes de lo esperado", start.path.display());
            start.position.store(playable, Ordering::Relaxed);
            return StreamExit::Finished;
        }

        let frame = Frame {
            data: data.into(),
            volume: ctl.volume,
            position_ms: pos_ms,
        };

        loop {
            match sink.write(frame.clone()).await {
                Ok(()) => break,
                Err(SinkError::Backpressure) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return StreamExit::Cancelled,
                        _ = tokio::time::sleep(timing.backpressure_retry) => {}
                    }
                }
                Err(SinkError::Closed) => return StreamExit::SinkClosed,
            }
        }

        pos_ms = next_ms;
        start.position.store(pos_ms, Ordering::Relaxed);
    }

    StreamExit::Finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    fn timing() -> StreamTiming {
        StreamTiming {
            frame: Duration::from_millis(5),
            backpressure_retry: Duration::from_millis(2),
        }
    }

    fn artifact(len: usize) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(file.path(), data).unwrap();
        file
    }

    fn start_for(file: &tempfile::NamedTempFile, duration_ms: u64) -> StreamStart {
        StreamStart {
            generation: 1,
            path: file.path().to_path_buf(),
            size_bytes: std::fs::metadata(file.path()).unwrap().len(),
            source_duration_ms: duration_ms,
            start_ms: 0,
            end_ms: duration_ms,
            offset_ms: 0,
            position: Arc::new(AtomicU64::new(0)),
        }
    }

    fn spawn_with_exit(
        start: StreamStart,
        sink: Arc<RecordingSink>,
        control: watch::Receiver<StreamControl>,
    ) -> (PullLoop, oneshot::Receiver<StreamExit>) {
        let (tx, rx) = oneshot::channel();
        let pull = PullLoop::spawn(start, sink, control, timing(), move |exit| {
            let _ = tx.send(exit);
        });
        (pull, rx)
    }

    #[tokio::test]
    async fn streams_whole_artifact_in_order() {
        let file = artifact(1_000);
        let start = start_for(&file, 100);
        let position = start.position.clone();
        let sink = Arc::new(RecordingSink::new());
        let (_tx, control) = watch::channel(StreamControl {
            paused: false,
            volume: 70,
        });

        let (_pull, exit) = spawn_with_exit(start, sink.clone(), control);
        assert_eq!(exit.await.unwrap(), StreamExit::Finished);

        let frames = sink.frames();
        assert_eq!(frames.len(), 20);
        let bytes: Vec<u8> = frames.iter().flat_map(|f| f.data.to_vec()).collect();
        assert_eq!(bytes, std::fs::read(file.path()).unwrap());
        assert!(frames.iter().all(|f| f.volume == 70));
        assert_eq!(frames[3].position_ms, 15);
        assert_eq!(position.load(Ordering::Relaxed), 100);
    }

    #[tokio::test]
    async fn chapter_window_and_offset_select_the_right_bytes() {
        let file = artifact(1_000);
        let mut start = start_for(&file, 100);
        start.start_ms = 40;
        start.end_ms = 80;
        start.offset_ms = 10;
        let sink = Arc::new(RecordingSink::new());
        let (_tx, control) = watch::channel(StreamControl {
            paused: false,
            volume: 50,
        });

        let (_pull, exit) = spawn_with_exit(start, sink.clone(), control);
        assert_eq!(exit.await.unwrap(), StreamExit::Finished);

        let bytes: Vec<u8> = sink.frames().iter().flat_map(|f| f.data.to_vec()).collect();
        let all = std::fs::read(file.path()).unwrap();
        assert_eq!(bytes, all[500..800].to_vec());
        assert_eq!(sink.frames()[0].position_ms, 10);
    }

    #[tokio::test]
    async fn backpressure_delays_but_does_not_drop_frames() {
        let file = artifact(200);
        let start = start_for(&file, 20);
        let sink = Arc::new(RecordingSink::new().with_backpressure(3));
        let (_tx, control) = watch::channel(StreamControl {
            paused: false,
            volume: 50,
        });

        let (_pull, exit) = spawn_with_exit(start, sink.clone(), control);
        assert_eq!(exit.await.unwrap(), StreamExit::Finished);
        assert_eq!(sink.frames().len(), 4);
        assert_eq!(sink.rejected(), 3);
    }

    #[tokio::test]
    async fn closed_sink_ends_the_stream() {
        let file = artifact(200);
        let start = start_for(&file, 20);
        let sink = Arc::new(RecordingSink::new());
        sink.close();
        let (_tx, control) = watch::channel(StreamControl {
            paused: false,
            volume: 50,
        });

        let (_pull, exit) = spawn_with_exit(start, sink, control);
        assert_eq!(exit.await.unwrap(), StreamExit::SinkClosed);
    }

    #[tokio::test]
    async fn pause_holds_position_and_volume_changes_apply_per_frame() {
        let file = artifact(2_000);
        let start = start_for(&file, 200);
        let position = start.position.clone();
        let sink = Arc::new(RecordingSink::new());
        let (tx, control) = watch::channel(StreamControl {
            paused: true,
            volume: 80,
        });

        let (_pull, exit) = spawn_with_exit(start, sink.clone(), control);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sink.frames().is_empty());
        assert_eq!(position.load(Ordering::Relaxed), 0);

        tx.send_replace(StreamControl {
            paused: false,
            volume: 20,
        });
        assert_eq!(exit.await.unwrap(), StreamExit::Finished);
        assert!(sink.frames().iter().all(|f| f.volume == 20));
    }

    #[tokio::test]
    async fn stop_cancels_without_reporting() {
        let file = artifact(100_000);
        let start = start_for(&file, 10_000);
        let sink = Arc::new(RecordingSink::new());
        let (_tx, control) = watch::channel(StreamControl {
            paused: false,
            volume: 50,
        });

        let (pull, exit) = spawn_with_exit(start, sink.clone(), control);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pull.stop();

        // el callback nunca se llama: el sender se descarta
        assert!(exit.await.is_err());
        let written = sink.frames().len();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.frames().len(), written);
    }

    #[tokio::test]
    async fn missing_artifact_fails() {
        let mut start = start_for(&artifact(10), 10);
        start.path = PathBuf::from("/nonexistent/artifact.opus");
        let sink = Arc::new(RecordingSink::new());
        let (_tx, control) = watch::channel(StreamControl {
            paused: false,
            volume: 50,
        });

        let (_pull, exit) = spawn_with_exit(start, sink, control);
        assert!(matches!(exit.await.unwrap(), StreamExit::Failed(_)));
    }
}
