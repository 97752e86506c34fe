//! In-memory fakes for the fetch and sink seams.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crate::cache::{FetchedAudio, Fetcher, SourceKey};
use crate::error::{FetchError, SinkError};
use crate::sources::{Frame, Sink};

const CHUNK: usize = 1024;

/// Fetcher que sirve bytes generados en memoria
#[derive(Default)]
pub struct MemoryFetcher {
    sources: Mutex<HashMap<SourceKey, usize>>,
    failures: Mutex<HashMap<SourceKey, FetchError>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(self, key: &SourceKey, size: usize) -> Self {
        self.sources.lock().insert(key.clone(), size);
        self
    }

    pub fn with_failure(self, key: &SourceKey, error: FetchError) -> Self {
        self.failures.lock().insert(key.clone(), error);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn clear_failure(&self, key: &SourceKey) {
        self.failures.lock().remove(key);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, key: &SourceKey) -> Result<FetchedAudio, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.failures.lock().get(key).cloned() {
            return Err(error);
        }
        let size = self
            .sources
            .lock()
            .get(key)
            .copied()
            .ok_or_else(|| FetchError::permanent(format!("unknown source {}", key)))?;

        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<std::io::Result<Bytes>> = data
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        Ok(FetchedAudio {
            stream: futures::stream::iter(chunks).boxed(),
            size_hint: Some(size as u64),
        })
    }
}

/// Sink que guarda cada frame aceptado
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
    backpressure: AtomicUsize,
    rejected: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rechaza las primeras `count` escrituras con backpressure
    pub fn with_backpressure(self, count: usize) -> Self {
        self.backpressure.store(count, Ordering::SeqCst);
        self
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write(&self, frame: Frame) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        let pending = self.backpressure.load(Ordering::SeqCst);
        if pending > 0 {
            self.backpressure.store(pending - 1, Ordering::SeqCst);
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(SinkError::Backpressure);
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}
