use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Caché de audio
    pub cache_limit_bytes: u64,
    pub fetch_timeout: Duration,
    pub failed_fetch_cooldown: Duration,
    pub maintenance_interval: Duration,

    // Reproducción
    pub max_consecutive_failures: u32,
    pub max_history: usize,
    pub frame_duration_ms: u64,
    pub backpressure_retry_ms: u64,
    pub event_buffer: usize,

    // Herramientas externas
    pub ffmpeg_path: String,
    pub ytdlp_path: String,

    // Rendimiento
    pub worker_threads: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir: PathBuf = std::env::var("DATA_DIR")
            .unwrap_or_else(|_| "/app/data".to_string())
            .into();

        let config = Self {
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("cache")),
            data_dir,

            cache_limit_bytes: parse_size(
                &std::env::var("CACHE_LIMIT").unwrap_or_else(|_| "2GB".to_string()),
            )?,
            fetch_timeout: humantime::parse_duration(
                &std::env::var("FETCH_TIMEOUT").unwrap_or_else(|_| "2m".to_string()),
            )?,
            failed_fetch_cooldown: humantime::parse_duration(
                &std::env::var("FAILED_FETCH_COOLDOWN").unwrap_or_else(|_| "5m".to_string()),
            )?,
            maintenance_interval: humantime::parse_duration(
                &std::env::var("MAINTENANCE_INTERVAL").unwrap_or_else(|_| "60s".to_string()),
            )?,

            max_consecutive_failures: std::env::var("MAX_CONSECUTIVE_FAILURES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            max_history: std::env::var("MAX_HISTORY")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,
            frame_duration_ms: std::env::var("FRAME_DURATION_MS")
                .unwrap_or_else(|_| "20".to_string()) // 960 samples @ 48kHz
                .parse()?,
            backpressure_retry_ms: std::env::var("BACKPRESSURE_RETRY_MS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
            event_buffer: std::env::var("EVENT_BUFFER")
                .unwrap_or_else(|_| "256".to_string())
                .parse()?,

            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),

            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.parse()?,
                _ => num_cpus::get(),
            },
        };

        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - The cache ceiling, fetch timeout, frame duration and maintenance
    ///   interval must be non-zero
    /// - At least one consecutive load failure must be tolerated
    /// - The notification buffer must hold at least one event
    pub fn validate(&self) -> Result<()> {
        if self.cache_limit_bytes == 0 {
            anyhow::bail!("Cache limit must be greater than 0");
        }

        if self.fetch_timeout.is_zero() {
            anyhow::bail!("Fetch timeout must be greater than 0");
        }

        if self.frame_duration_ms == 0 {
            anyhow::bail!("Frame duration must be greater than 0");
        }

        if self.maintenance_interval.is_zero() {
            anyhow::bail!("Maintenance interval must be greater than 0");
        }

        if self.max_consecutive_failures == 0 {
            anyhow::bail!("Max consecutive failures must be greater than 0");
        }

        if self.event_buffer == 0 {
            anyhow::bail!("Event buffer must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Paths: data={} cache={}\n  \
            Cache: {} ceiling, {} fetch timeout, {} cool-down\n  \
            Playback: {}ms frames, {} history, {} consecutive failures\n  \
            Workers: {}",
            self.data_dir.display(),
            self.cache_dir.display(),
            format_size(self.cache_limit_bytes),
            humantime::format_duration(self.fetch_timeout),
            humantime::format_duration(self.failed_fetch_cooldown),
            self.frame_duration_ms,
            self.max_history,
            self.max_consecutive_failures,
            self.worker_threads,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "/app/data".into(),
            cache_dir: "/app/data/cache".into(),

            cache_limit_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            fetch_timeout: Duration::from_secs(120),
            failed_fetch_cooldown: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(60),

            max_consecutive_failures: 3,
            max_history: 50,
            frame_duration_ms: 20, // 20ms at 48kHz
            backpressure_retry_ms: 20,
            event_buffer: 256,

            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),

            worker_threads: num_cpus::get(),
        }
    }
}

/// Convierte "2GB", "512MB", "1.5 GB" o "300" (MB) a bytes
pub fn parse_size(raw: &str) -> Result<u64> {
    let value = raw.trim().to_ascii_uppercase();

    let split_at = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split_at);

    let multiplier: u64 = match unit.trim() {
        "" | "MB" => 1024 * 1024,
        "B" => 1,
        "KB" => 1024,
        "GB" => 1024 * 1024 * 1024,
        "TB" => 1024 * 1024 * 1024 * 1024,
        other => anyhow::bail!("Unknown size unit '{}' in '{}'", other, raw),
    };

    let number: f64 = number.trim().parse()?;
    if !number.is_finite() || number < 0.0 {
        anyhow::bail!("Invalid size '{}'", raw);
    }

    Ok((number * multiplier as f64) as u64)
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
