use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::time::Duration;

use crate::cache::SourceKey;
use crate::error::{EngineError, Result};
use crate::sources::SourceDescriptor;

/// Un elemento de la cola. Inmutable tras su creación.
///
/// `duration_ms` is the length of the whole source. A chapter track plays the
/// window `[chapter_offset_ms, chapter_end_ms)` of that source; positions
/// reported by the session are relative to the start of the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    source_key: SourceKey,
    title: String,
    duration_ms: u64,
    added_by: UserId,
    added_at: DateTime<Utc>,
    chapter_offset_ms: Option<u64>,
    chapter_end_ms: Option<u64>,
}

impl Track {
    pub fn new(
        source_key: SourceKey,
        title: impl Into<String>,
        duration_ms: u64,
        added_by: UserId,
    ) -> Result<Self> {
        let title = title.into();
        if duration_ms == 0 {
            return Err(EngineError::InvalidTrack(format!(
                "'{}' has no playable duration",
                title
            )));
        }

        Ok(Self {
            source_key,
            title,
            duration_ms,
            added_by,
            added_at: Utc::now(),
            chapter_offset_ms: None,
            chapter_end_ms: None,
        })
    }

    /// Restringe la reproducción a un capítulo de la fuente
    pub fn with_chapter(mut self, offset_ms: u64, end_ms: Option<u64>) -> Result<Self> {
        let end = end_ms.unwrap_or(self.duration_ms);
        if end > self.duration_ms || offset_ms >= end {
            return Err(EngineError::InvalidTrack(format!(
                "chapter [{}, {}) outside '{}' ({}ms)",
                offset_ms, end, self.title, self.duration_ms
            )));
        }

        self.chapter_offset_ms = Some(offset_ms);
        self.chapter_end_ms = end_ms;
        Ok(self)
    }

    pub fn source_key(&self) -> &SourceKey {
        &self.source_key
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn added_by(&self) -> UserId {
        self.added_by
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn chapter_offset_ms(&self) -> Option<u64> {
        self.chapter_offset_ms
    }

    pub fn chapter_end_ms(&self) -> Option<u64> {
        self.chapter_end_ms
    }

    /// Inicio absoluto dentro de la fuente
    pub fn start_ms(&self) -> u64 {
        self.chapter_offset_ms.unwrap_or(0)
    }

    /// Fin absoluto dentro de la fuente
    pub fn end_ms(&self) -> u64 {
        self.chapter_end_ms.unwrap_or(self.duration_ms)
    }

    /// Duración reproducible (el capítulo, o la fuente completa)
    pub fn playable_ms(&self) -> u64 {
        self.end_ms() - self.start_ms()
    }

    pub fn playable_duration(&self) -> Duration {
        Duration::from_millis(self.playable_ms())
    }

    pub fn from_descriptor(descriptor: &SourceDescriptor, added_by: UserId) -> Result<Self> {
        Track::new(
            descriptor.source_key.clone(),
            descriptor.title.clone(),
            descriptor.duration_ms,
            added_by,
        )
    }

    /// Un track por capítulo; todos comparten la misma `SourceKey` (y el mismo artefacto)
    pub fn chapters_from_descriptor(
        descriptor: &SourceDescriptor,
        added_by: UserId,
    ) -> Result<Vec<Self>> {
        if descriptor.chapters.is_empty() {
            return Ok(vec![Self::from_descriptor(descriptor, added_by)?]);
        }

        descriptor
            .chapters
            .iter()
            .map(|chapter| {
                Track::new(
                    descriptor.source_key.clone(),
                    format!("{} - {}", descriptor.title, chapter.title),
                    descriptor.duration_ms,
                    added_by,
                )?
                .with_chapter(chapter.start_ms, Some(chapter.end_ms))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::Chapter;

    fn key() -> SourceKey {
        SourceKey::provider("youtube", "dQw4w9WgXcQ")
    }

    #[test]
    fn rejects_zero_duration() {
        assert!(matches!(
            Track::new(key(), "Empty", 0, UserId::new(1)),
            Err(EngineError::InvalidTrack(_))
        ));
    }

    #[test]
    fn chapter_bounds_must_fit_duration() {
        let track = Track::new(key(), "Mix", 10_000, UserId::new(1)).unwrap();

        let chapter = track.clone().with_chapter(2_000, Some(5_000)).unwrap();
        assert_eq!(chapter.start_ms(), 2_000);
        assert_eq!(chapter.end_ms(), 5_000);
        assert_eq!(chapter.playable_ms(), 3_000);

        let open_ended = track.clone().with_chapter(9_000, None).unwrap();
        assert_eq!(open_ended.playable_ms(), 1_000);

        assert!(track.clone().with_chapter(2_000, Some(12_000)).is_err());
        assert!(track.clone().with_chapter(5_000, Some(5_000)).is_err());
        assert!(track.with_chapter(10_000, None).is_err());
    }

    #[test]
    fn descriptor_chapters_share_source_key() {
        let descriptor = SourceDescriptor {
            source_key: key(),
            title: "Album".to_string(),
            duration_ms: 9_000,
            chapters: vec![
                Chapter {
                    title: "One".to_string(),
                    start_ms: 0,
                    end_ms: 4_000,
                },
                Chapter {
                    title: "Two".to_string(),
                    start_ms: 4_000,
                    end_ms: 9_000,
                },
            ],
        };

        let tracks = Track::chapters_from_descriptor(&descriptor, UserId::new(3)).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks.iter().all(|t| t.source_key() == &key()));
        assert_eq!(tracks[1].title(), "Album - Two");
        assert_eq!(tracks[1].playable_ms(), 5_000);
    }
}
