//! # Audio Module
//!
//! Per-guild playback engine: the queue, the playback state machine, and the
//! paced stream that feeds cached audio to a voice transport.
//!
//! ## Architecture
//!
//! Each guild is served by one worker task that owns its state outright, so
//! nothing in here needs a lock:
//!
//! ### [`queue`] - Queue Management
//! - Pending tracks (the playing track is never in the queue)
//! - Bounded history for "previous" / unskip
//! - Playlist insertion with limits, paging, shuffle
//!
//! ### [`session`] - Playback State Machine
//! - `Idle -> Loading -> Playing <-> Paused`
//! - Track/queue loop, skip N, seek, bounded load-failure retry
//!
//! ### [`stream`] - Pull Loop
//! - Reads the cached artifact one frame at a time and writes it to the sink
//! - Honors pause, volume, ducking and sink backpressure
//!
//! ### [`worker`] / [`manager`] - Concurrency
//! - A command mailbox per guild; commands apply in submission order
//! - Cache loads and streams run off the worker, reporting back by message
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guildcast::audio::{manager::SessionManager, queue::EnqueueMode};
//! use guildcast::sources::Sink;
//! use serenity::model::id::{GuildId, UserId};
//! use std::sync::Arc;
//!
//! # async fn example(manager: SessionManager, sink: Arc<dyn Sink>) -> anyhow::Result<()> {
//! let guild = manager.join(GuildId::new(123456789), sink).await;
//!
//! guild.play("never gonna give you up", UserId::new(1), EnqueueMode::Append).await?;
//! guild.pause().await?;
//! guild.resume().await?;
//! guild.skip(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod effects;
pub mod manager;
pub mod queue;
pub mod session;
pub mod stream;
pub mod track;
pub mod worker;
