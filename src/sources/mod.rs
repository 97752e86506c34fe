//! Edges of the engine: where tracks come from and where frames go.
//!
//! - [`Resolver`] turns a user query or URL into [`SourceDescriptor`]s
//! - [`Fetcher`](crate::cache::Fetcher) (implemented by [`FfmpegTranscoder`])
//!   turns a [`SourceKey`] into an Ogg/Opus byte stream for the cache
//! - [`Sink`] receives the paced [`Frame`]s of the playing track

pub mod ffmpeg;
pub mod ytdlp;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::SourceKey;
use crate::error::{ResolutionError, SinkError};

pub use ffmpeg::FfmpegTranscoder;
pub use ytdlp::YtDlpResolver;

/// Capítulo dentro de una fuente
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Resultado de resolver una consulta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub source_key: SourceKey,
    pub title: String,
    pub duration_ms: u64,
    pub chapters: Vec<Chapter>,
}

/// Trait común para todos los resolvers de música
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resuelve una búsqueda o URL a una única fuente
    async fn resolve(&self, query: &str) -> Result<SourceDescriptor, ResolutionError>;

    /// Obtiene hasta `limit` entradas de una playlist
    async fn resolve_playlist(
        &self,
        url: &str,
        limit: usize,
    ) -> Result<Vec<SourceDescriptor>, ResolutionError>;
}

/// Un frame de audio listo para el transporte de voz
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Bytes del artefacto correspondientes a este intervalo
    pub data: Bytes,
    /// Volumen efectivo (0..=100) con ducking aplicado
    pub volume: u8,
    /// Posición del inicio del frame, relativa al inicio del track
    pub position_ms: u64,
}

/// Transporte de salida.
///
/// `Err(SinkError::Backpressure)` asks the producer to hold the frame and
/// retry later; `Err(SinkError::Closed)` ends the stream.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, frame: Frame) -> Result<(), SinkError>;
}
