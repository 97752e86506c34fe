//! Error types for the broadcast engine.
//!
//! Caller/input errors (`OutOfRange`, `InvalidPageSize`, ...) go straight back
//! to the command layer. Fetch failures are cloned out to every single-flight
//! waiter, so [`FetchError`] carries its cause as text instead of a boxed source.

use std::fmt;

use thiserror::Error;

use crate::cache::SourceKey;

/// Clasificación de fallos de descarga/transcodificación
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Fallo de red o proceso; se reintenta en el siguiente `acquire`
    Transient,
    /// La descarga superó el tiempo máximo
    Timeout,
    /// La fuente no se puede obtener; se reintenta tras el cool-down
    Permanent,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => write!(f, "transient"),
            FetchErrorKind::Timeout => write!(f, "timeout"),
            FetchErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} fetch error: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Transient and timeout failures may be retried immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, FetchErrorKind::Permanent)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::transient(err.to_string())
    }
}

/// Errores del `Resolver` (consulta inválida, sin resultados, límite de peticiones)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no results for query: {0}")]
    NotFound(String),

    #[error("resolver rate limited")]
    RateLimited,

    #[error("invalid query or URL: {0}")]
    InvalidQuery(String),

    #[error("resolver failure: {0}")]
    Provider(String),
}

/// Errores del `Sink` de salida de audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// El sink no acepta más frames por ahora; se pausa la producción
    #[error("sink backpressure")]
    Backpressure,

    /// El transporte de voz se cerró
    #[error("sink closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("value {value} out of range (limit {limit})")]
    OutOfRange { value: u64, limit: u64 },

    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),

    #[error("cache entry not found: {0}")]
    NotFound(SourceKey),

    #[error("queue is full (max {limit} tracks)")]
    QueueFull { limit: usize },

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("no previous track in history")]
    HistoryEmpty,

    #[error("invalid track: {0}")]
    InvalidTrack(String),

    #[error("guild session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn out_of_range(value: impl TryInto<u64>, limit: impl TryInto<u64>) -> Self {
        EngineError::OutOfRange {
            value: value.try_into().unwrap_or(u64::MAX),
            limit: limit.try_into().unwrap_or(u64::MAX),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
