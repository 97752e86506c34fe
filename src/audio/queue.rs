use rand::seq::SliceRandom;
use std::{collections::VecDeque, ops::Range, time::Duration};
use tracing::{debug, info};

use crate::audio::track::Track;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Al final de la cola
    Append,
    /// Como siguiente canción
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

/// Cola pendiente de un servidor más su historial acotado.
///
/// The track that is currently playing lives in the `PlaybackSession`, never
/// here, so index 0 is always the next track to play. Positions are 0-based.
#[derive(Debug)]
pub struct QueueManager {
    items: VecDeque<Track>,
    history: VecDeque<Track>,
    max_size: usize,
    max_history: usize,
}

impl QueueManager {
    pub fn new(max_size: usize, max_history: usize) -> Self {
        Self {
            items: VecDeque::new(),
            history: VecDeque::with_capacity(max_history.min(64)),
            max_size: max_size.max(1),
            max_history,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
    }

    /// Agrega un track a la cola; devuelve su posición
    pub fn enqueue(&mut self, track: Track, mode: EnqueueMode) -> Result<usize> {
        if self.items.len() >= self.max_size {
            return Err(EngineError::QueueFull {
                limit: self.max_size,
            });
        }

        info!("➕ Agregado a la cola: {}", track.title());
        match mode {
            EnqueueMode::Append => {
                self.items.push_back(track);
                Ok(self.items.len() - 1)
            }
            EnqueueMode::Front => {
                self.items.push_front(track);
                Ok(0)
            }
        }
    }

    /// Agrega múltiples tracks (playlist) al final, respetando ambos límites
    pub fn enqueue_playlist(&mut self, tracks: Vec<Track>, playlist_limit: usize) -> usize {
        let available_space = self.max_size.saturating_sub(self.items.len());
        let to_add = tracks.len().min(available_space).min(playlist_limit);

        self.items.extend(tracks.into_iter().take(to_add));

        info!("➕ Agregadas {} canciones a la cola", to_add);
        to_add
    }

    /// Re-encola sin chequear capacidad (loop de cola, unskip)
    pub(crate) fn requeue(&mut self, track: Track, mode: EnqueueMode) {
        match mode {
            EnqueueMode::Append => self.items.push_back(track),
            EnqueueMode::Front => self.items.push_front(track),
        }
    }

    /// Quita la última copia pendiente de `track` (misma fuente y mismo `added_at`)
    pub(crate) fn remove_last_copy(&mut self, track: &Track) -> bool {
        let found = self.items.iter().rposition(|t| {
            t.source_key() == track.source_key() && t.added_at() == track.added_at()
        });
        match found {
            Some(position) => self.items.remove(position).is_some(),
            None => false,
        }
    }

    /// Saca la siguiente canción (FIFO)
    pub fn pop_next(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    pub fn remove(&mut self, position: usize) -> Result<Track> {
        let len = self.items.len();
        let track = self
            .items
            .remove(position)
            .ok_or_else(|| EngineError::out_of_range(position, len))?;
        debug!("❌ Track eliminado en posición {}", position);
        Ok(track)
    }

    pub fn remove_range(&mut self, range: Range<usize>) -> Result<Vec<Track>> {
        if range.start >= range.end {
            return Err(EngineError::out_of_range(range.start, range.end));
        }
        if range.end > self.items.len() {
            return Err(EngineError::out_of_range(range.end, self.items.len()));
        }

        let removed: Vec<Track> = self.items.drain(range.clone()).collect();
        debug!(
            "❌ {} tracks eliminados ({}..{})",
            removed.len(),
            range.start,
            range.end
        );
        Ok(removed)
    }

    /// Mueve un track a una nueva posición
    pub fn move_track(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.items.len();
        if from >= len {
            return Err(EngineError::out_of_range(from, len));
        }
        if to >= len {
            return Err(EngineError::out_of_range(to, len));
        }

        if from != to {
            if let Some(track) = self.items.remove(from) {
                self.items.insert(to, track);
            }
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Mezcla la cola pendiente
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.items.make_contiguous().shuffle(&mut rng);
        info!("🔀 Cola mezclada");
    }

    /// Limpia solo la cola pendiente; devuelve cuántos se eliminaron
    pub fn clear(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        info!("🗑️ Cola limpiada: {} tracks removidos", cleared);
        cleared
    }

    pub fn push_history(&mut self, track: Track) {
        if self.max_history == 0 {
            return;
        }
        if self.history.len() >= self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(track);
    }

    pub fn pop_history(&mut self) -> Option<Track> {
        self.history.pop_back()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Historial, más antiguo primero
    pub fn history(&self) -> impl Iterator<Item = &Track> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn get(&self, position: usize) -> Option<&Track> {
        self.items.get(position)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_duration(&self) -> Duration {
        self.items.iter().map(Track::playable_duration).sum()
    }

    /// Obtiene una página de la cola (índice de página desde 0)
    pub fn page(&self, page_index: usize, page_size: usize) -> Result<QueuePage> {
        if page_size == 0 {
            return Err(EngineError::InvalidPageSize(page_size));
        }

        let total_items = self.items.len();
        let total_pages = total_items.div_ceil(page_size).max(1);
        let page = page_index.min(total_pages - 1);
        let start = page * page_size;
        let end = (start + page_size).min(total_items);

        Ok(QueuePage {
            items: (start..end)
                .filter_map(|i| self.items.get(i).map(|t| (i, t.clone())))
                .collect(),
            page,
            total_pages,
            total_items,
            total_duration: self.total_duration(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePage {
    /// (posición en la cola, track)
    pub items: Vec<(usize, Track)>,
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
    pub total_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SourceKey;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn track(name: &str) -> Track {
        Track::new(
            SourceKey::from_canonical(format!("test:{name}")),
            name,
            1_000,
            UserId::new(1),
        )
        .unwrap()
    }

    fn titles(queue: &QueueManager) -> Vec<String> {
        queue.tracks().map(|t| t.title().to_string()).collect()
    }

    fn queue_of(names: &[&str]) -> QueueManager {
        let mut queue = QueueManager::new(100, 10);
        for name in names {
            queue.enqueue(track(name), EnqueueMode::Append).unwrap();
        }
        queue
    }

    #[test]
    fn enqueue_front_and_append() {
        let mut queue = queue_of(&["A", "B"]);
        assert_eq!(queue.enqueue(track("C"), EnqueueMode::Front).unwrap(), 0);
        assert_eq!(queue.enqueue(track("D"), EnqueueMode::Append).unwrap(), 3);
        assert_eq!(titles(&queue), vec!["C", "A", "B", "D"]);
    }

    #[test]
    fn enqueue_respects_capacity() {
        let mut queue = QueueManager::new(2, 10);
        queue.enqueue(track("A"), EnqueueMode::Append).unwrap();
        queue.enqueue(track("B"), EnqueueMode::Append).unwrap();
        assert!(matches!(
            queue.enqueue(track("C"), EnqueueMode::Append),
            Err(EngineError::QueueFull { limit: 2 })
        ));
    }

    #[test]
    fn playlist_is_capped_by_limit_and_space() {
        let mut queue = QueueManager::new(5, 10);
        queue.enqueue(track("A"), EnqueueMode::Append).unwrap();

        let playlist: Vec<Track> = ["P1", "P2", "P3", "P4", "P5"].map(track).into();
        assert_eq!(queue.enqueue_playlist(playlist.clone(), 3), 3);
        assert_eq!(titles(&queue), vec!["A", "P1", "P2", "P3"]);

        // solo queda un lugar
        assert_eq!(queue.enqueue_playlist(playlist, 50), 1);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn remove_and_remove_range() {
        let mut queue = queue_of(&["A", "B", "C", "D", "E"]);

        assert_eq!(queue.remove(1).unwrap().title(), "B");
        assert!(matches!(
            queue.remove(4),
            Err(EngineError::OutOfRange { value: 4, limit: 4 })
        ));

        let removed = queue.remove_range(1..3).unwrap();
        assert_eq!(
            removed.iter().map(|t| t.title()).collect::<Vec<_>>(),
            vec!["C", "D"]
        );
        assert_eq!(titles(&queue), vec!["A", "E"]);

        assert!(queue.remove_range(1..3).is_err());
        assert!(queue.remove_range(1..1).is_err());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn move_is_stable_for_other_positions() {
        let mut queue = queue_of(&["A", "B", "C", "D"]);
        queue.move_track(0, 2).unwrap();
        assert_eq!(titles(&queue), vec!["B", "C", "A", "D"]);
        queue.move_track(3, 0).unwrap();
        assert_eq!(titles(&queue), vec!["D", "B", "C", "A"]);

        assert!(queue.move_track(4, 0).is_err());
        assert!(queue.move_track(0, 4).is_err());
        assert_eq!(titles(&queue), vec!["D", "B", "C", "A"]);
    }

    #[test]
    fn shuffle_keeps_the_same_tracks() {
        let mut queue = queue_of(&["A", "B", "C", "D", "E", "F"]);
        queue.shuffle();

        let mut shuffled = titles(&queue);
        shuffled.sort();
        assert_eq!(shuffled, vec!["A", "B", "C", "D", "E", "F"]);
    }

    #[test]
    fn clear_keeps_history() {
        let mut queue = queue_of(&["A", "B"]);
        queue.push_history(track("H"));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.history_len(), 1);
    }

    #[test]
    fn history_is_bounded_and_pops_most_recent() {
        let mut queue = QueueManager::new(10, 3);
        for name in ["1", "2", "3", "4"] {
            queue.push_history(track(name));
        }
        assert_eq!(
            queue.history().map(|t| t.title()).collect::<Vec<_>>(),
            vec!["2", "3", "4"]
        );
        assert_eq!(queue.pop_history().unwrap().title(), "4");
        assert_eq!(queue.history_len(), 2);
    }

    #[test]
    fn paging_stays_within_bounds() {
        let queue = queue_of(&["A", "B", "C", "D", "E"]);

        let first = queue.page(0, 2).unwrap();
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.items.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);

        let last = queue.page(2, 2).unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].1.title(), "E");

        // una página fuera de rango se recorta a la última
        let clamped = queue.page(99, 2).unwrap();
        assert_eq!(clamped.page, 2);
        assert!(clamped.items.iter().all(|(i, _)| *i < queue.len()));

        assert_eq!(first.total_duration, Duration::from_secs(5));
        assert!(matches!(queue.page(0, 0), Err(EngineError::InvalidPageSize(0))));
    }

    #[test]
    fn empty_queue_has_one_empty_page() {
        let queue = QueueManager::new(10, 10);
        let page = queue.page(3, 10).unwrap();
        assert_eq!(page.page, 0);
        assert_eq!(page.total_pages, 1);
        assert!(page.items.is_empty());
    }
}
