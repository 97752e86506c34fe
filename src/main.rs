use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use guildcast::audio::manager::SessionManager;
use guildcast::cache::{AudioCache, CacheSettings};
use guildcast::config::{format_size, Config};
use guildcast::events::{self, EngineEvent, EventStream};
use guildcast::sources::{FfmpegTranscoder, Resolver, YtDlpResolver};
use guildcast::storage::JsonStorage;

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guildcast=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando guildcast v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check(&config));
    }

    let prefetch: Vec<String> = std::env::args()
        .skip_while(|arg| arg != "--prefetch")
        .skip(1)
        .collect();

    runtime.block_on(run(config, prefetch))
}

async fn run(config: Config, prefetch: Vec<String>) -> Result<()> {
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let storage = Arc::new(JsonStorage::new(config.data_dir.clone()).await?);

    let (notifier, events) = events::channel(config.event_buffer);

    // Inicializar caché
    let (cache, report) = AudioCache::open(
        CacheSettings::from_config(&config),
        Arc::new(FfmpegTranscoder::from_config(&config)),
        notifier.clone(),
    )
    .await?;
    info!(
        "💾 Caché: {} restaurados, {} huérfanos, {} perdidos, {} desalojados",
        report.restored, report.orphans_removed, report.missing, report.evicted
    );

    let resolver = Arc::new(YtDlpResolver::from_config(&config));

    if !prefetch.is_empty() {
        return prefetch_all(&cache, resolver.as_ref(), &prefetch).await;
    }

    let manager = SessionManager::new(&config, cache.clone(), storage, resolver, notifier);

    let cancel = CancellationToken::new();
    let maintenance = manager.spawn_maintenance(config.maintenance_interval, cancel.clone());
    let event_log = tokio::spawn(log_events(events));

    info!("🚀 Motor iniciado, esperando sesiones");

    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    manager.shutdown().await;
    cancel.cancel();
    if let Err(e) = maintenance.await {
        warn!("Mantenimiento terminó con error: {}", e);
    }
    event_log.abort();

    cache.evict_if_over_budget();
    if let Err(e) = cache.save_index().await {
        error!("❌ No se pudo guardar el índice del caché: {}", e);
    }
    info!("{}", cache.stats(0));

    Ok(())
}

/// Descarga al caché las consultas dadas y termina
async fn prefetch_all(cache: &AudioCache, resolver: &dyn Resolver, queries: &[String]) -> Result<()> {
    for query in queries {
        let descriptor = match resolver.resolve(query).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("❌ '{}': {}", query, e);
                continue;
            }
        };

        match cache.acquire(&descriptor.source_key).await {
            Ok(handle) => info!(
                "✅ {} ({}) en caché",
                descriptor.title,
                format_size(handle.size_bytes())
            ),
            Err(e) => warn!("❌ {}: {}", descriptor.title, e),
        }
    }

    cache.save_index().await?;
    info!("{}", cache.stats(10));
    Ok(())
}

async fn log_events(events: EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::TrackStarted {
                guild_id,
                track,
                announce,
            } => info!(
                "🎶 [{}] Empezó: {}{}",
                guild_id,
                track.title(),
                if announce { " (anunciar)" } else { "" }
            ),
            EngineEvent::TrackEnded { guild_id, track } => {
                info!("🏁 [{}] Terminó: {}", guild_id, track.title())
            }
            EngineEvent::QueueStalled { guild_id, skipped } => {
                warn!("🛑 [{}] Cola detenida, {} fallidos", guild_id, skipped.len())
            }
            EngineEvent::QueueExhausted { guild_id, skipped } => {
                info!("📭 [{}] Cola vacía, {} fallidos", guild_id, skipped.len())
            }
            EngineEvent::IdleTimeout { guild_id } => info!("💤 [{}] Inactivo", guild_id),
            EngineEvent::CacheEvicted { key, bytes_freed } => {
                info!("🧹 Desalojado {} ({})", key, format_size(bytes_freed))
            }
        }
    }
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
