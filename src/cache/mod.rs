//! # Cache Module
//!
//! Size-bounded, content-addressed store of transcoded audio shared by every
//! guild session in the process.
//!
//! ## Features
//!
//! - **Single-flight**: concurrent `acquire` calls for one [`SourceKey`] share a
//!   single fetch/transcode; late callers wait on the in-flight result
//! - **Pinning**: an [`ArtifactHandle`] keeps its entry alive while a session
//!   streams from it; dropping the handle releases it
//! - **LRU eviction**: once over the byte ceiling, unpinned `Ready` entries are
//!   removed oldest-access first
//! - **Failure cool-down**: permanent fetch errors are remembered and returned
//!   until the cool-down expires; transient/timeout errors retry on the next call
//! - **Restart reconciliation**: `index.json` is reloaded at startup and files
//!   on disk that the index does not know about are deleted
//!
//! ## Layout on disk
//!
//! ```text
//! <CACHE_DIR>/
//!   index.json                 # persisted index (Ready entries only)
//!   <sha256(key)>.opus         # one artifact per SourceKey
//!   tmp/                       # partial downloads, wiped at startup
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guildcast::cache::{AudioCache, CacheSettings, SourceKey};
//! use guildcast::sources::FfmpegTranscoder;
//! use guildcast::events::Notifier;
//! use std::sync::Arc;
//!
//! # async fn example(config: guildcast::config::Config) -> anyhow::Result<()> {
//! let (cache, report) = AudioCache::open(
//!     CacheSettings::from_config(&config),
//!     Arc::new(FfmpegTranscoder::from_config(&config)),
//!     Notifier::disabled(),
//! )
//! .await?;
//! println!("restored {} artifacts", report.restored);
//!
//! let key = SourceKey::from_url("https://youtu.be/dQw4w9WgXcQ")?;
//! let handle = cache.acquire(&key).await?;   // fetch on miss, pinned
//! println!("{} bytes at {}", handle.size_bytes(), handle.path().display());
//! drop(handle);                              // unpinned, evictable
//! # Ok(())
//! # }
//! ```

pub mod audio_cache;
pub mod key;
pub mod persist;

pub use audio_cache::{
    ArtifactHandle, AudioCache, CacheSettings, CacheStats, CachedArtifact, EvictionReport,
    FetchedAudio, Fetcher,
};
pub use key::SourceKey;
pub use persist::ReconcileReport;
