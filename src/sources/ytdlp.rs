use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Chapter, Resolver, SourceDescriptor};
use crate::cache::SourceKey;
use crate::config::Config;
use crate::error::ResolutionError;

/// Resolver basado en los metadatos JSON de yt-dlp
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    url: Option<String>,
    extractor_key: Option<String>,
    ie_key: Option<String>,
    #[serde(default)]
    chapters: Option<Vec<YtDlpChapter>>,
    #[serde(default)]
    entries: Option<Vec<YtDlpInfo>>,
}

#[derive(Debug, Deserialize)]
struct YtDlpChapter {
    title: Option<String>,
    start_time: f64,
    end_time: f64,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ytdlp_path.clone(), config.fetch_timeout)
    }

    async fn dump_json(&self, args: &[&str], target: &str) -> Result<String, ResolutionError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args([
            "--dump-single-json",
            "--skip-download",
            "--no-warnings",
            "--socket-timeout",
            "15",
        ])
        .args(args)
        .arg(target)
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ResolutionError::Provider("yt-dlp timed out".to_string()))?
            .map_err(|e| ResolutionError::Provider(format!("yt-dlp process error: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para '{}': {}", target, stderr.trim());
            return Err(classify_failure(target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<SourceDescriptor, ResolutionError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResolutionError::InvalidQuery("empty query".to_string()));
        }

        let target = if is_url(query) {
            // valida esquema antes de invocar el proceso
            SourceKey::from_url(query)?;
            query.to_string()
        } else {
            format!("ytsearch1:{}", query)
        };

        info!("🔍 Resolviendo: {}", target);
        let json = self.dump_json(&["--no-playlist"], &target).await?;
        let descriptors = parse_descriptors(&json)?;
        descriptors
            .into_iter()
            .next()
            .ok_or_else(|| ResolutionError::NotFound(query.to_string()))
    }

    async fn resolve_playlist(
        &self,
        url: &str,
        limit: usize,
    ) -> Result<Vec<SourceDescriptor>, ResolutionError> {
        SourceKey::from_url(url)?;
        let limit = limit.max(1).to_string();
        let json = self
            .dump_json(&["--flat-playlist", "--playlist-end", &limit], url)
            .await?;

        let descriptors = parse_descriptors(&json)?;
        debug!("📋 Playlist {}: {} entradas", url, descriptors.len());
        if descriptors.is_empty() {
            return Err(ResolutionError::NotFound(url.to_string()));
        }
        Ok(descriptors)
    }
}

fn is_url(query: &str) -> bool {
    query.starts_with("http://") || query.starts_with("https://") || query.contains("://")
}

fn classify_failure(target: &str, stderr: &str) -> ResolutionError {
    let lower = stderr.to_lowercase();
    if lower.contains("429") || lower.contains("too many requests") {
        ResolutionError::RateLimited
    } else if lower.contains("unsupported url") {
        ResolutionError::InvalidQuery(target.to_string())
    } else if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("does not exist")
        || lower.contains("no video results")
    {
        ResolutionError::NotFound(target.to_string())
    } else {
        ResolutionError::Provider(stderr.trim().to_string())
    }
}

/// Convierte la salida de `--dump-single-json` (video, búsqueda o playlist)
fn parse_descriptors(json: &str) -> Result<Vec<SourceDescriptor>, ResolutionError> {
    let info: YtDlpInfo = serde_json::from_str(json)
        .map_err(|e| ResolutionError::Provider(format!("invalid yt-dlp output: {}", e)))?;

    match info.entries {
        Some(entries) => Ok(entries.into_iter().filter_map(descriptor_from).collect()),
        None => Ok(descriptor_from(info).into_iter().collect()),
    }
}

fn descriptor_from(info: YtDlpInfo) -> Option<SourceDescriptor> {
    let duration_ms = info
        .duration
        .filter(|d| d.is_finite() && *d > 0.0)
        .map(|d| (d * 1000.0).round() as u64)?;

    let extractor = info
        .extractor_key
        .as_deref()
        .or(info.ie_key.as_deref())
        .unwrap_or_default();

    let source_key = match (extractor, info.id.as_deref()) {
        ("Youtube", Some(id)) => SourceKey::provider("youtube", id),
        _ => {
            let url = info.webpage_url.as_deref().or(info.url.as_deref())?;
            SourceKey::from_url(url).ok()?
        }
    };

    let chapters = info
        .chapters
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(i, c)| {
            let start_ms = (c.start_time.max(0.0) * 1000.0).round() as u64;
            let end_ms = ((c.end_time * 1000.0).round() as u64).min(duration_ms);
            (start_ms < end_ms).then(|| Chapter {
                title: c.title.unwrap_or_else(|| format!("Chapter {}", i + 1)),
                start_ms,
                end_ms,
            })
        })
        .collect();

    Some(SourceDescriptor {
        source_key,
        title: info.title.unwrap_or_else(|| "Unknown".to_string()),
        duration_ms,
        chapters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_single_video_with_chapters() {
        let json = r#"{
            "id": "dQw4w9WgXcQ",
            "title": "Never Gonna Give You Up",
            "duration": 212.5,
            "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "extractor_key": "Youtube",
            "chapters": [
                {"title": "Intro", "start_time": 0.0, "end_time": 18.0},
                {"start_time": 18.0, "end_time": 999.0}
            ]
        }"#;

        let descriptors = parse_descriptors(json).unwrap();
        assert_eq!(descriptors.len(), 1);
        let d = &descriptors[0];
        assert_eq!(d.source_key, SourceKey::provider("youtube", "dQw4w9WgXcQ"));
        assert_eq!(d.duration_ms, 212_500);
        assert_eq!(
            d.chapters,
            vec![
                Chapter {
                    title: "Intro".to_string(),
                    start_ms: 0,
                    end_ms: 18_000
                },
                Chapter {
                    title: "Chapter 2".to_string(),
                    start_ms: 18_000,
                    end_ms: 212_500
                },
            ]
        );
    }

    #[test]
    fn flat_playlist_skips_entries_without_duration() {
        let json = r#"{
            "title": "Mix",
            "entries": [
                {"id": "aaaaaaaaaaa", "title": "A", "duration": 100, "ie_key": "Youtube"},
                {"id": "bbbbbbbbbbb", "title": "Live", "duration": null, "ie_key": "Youtube"},
                {"title": "C", "duration": 50, "url": "https://cdn.example.com/c.mp3"}
            ]
        }"#;

        let descriptors = parse_descriptors(json).unwrap();
        let keys: Vec<_> = descriptors.iter().map(|d| d.source_key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["youtube:aaaaaaaaaaa", "https://cdn.example.com/c.mp3"]
        );
    }

    #[test]
    fn classifies_yt_dlp_errors() {
        assert_eq!(
            classify_failure("x", "ERROR: HTTP Error 429: Too Many Requests"),
            ResolutionError::RateLimited
        );
        assert!(matches!(
            classify_failure("x", "ERROR: [youtube] abc: Video unavailable"),
            ResolutionError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("x", "ERROR: Unsupported URL: https://nope"),
            ResolutionError::InvalidQuery(_)
        ));
    }

    #[test]
    fn garbage_output_is_a_provider_error() {
        assert!(matches!(
            parse_descriptors("not json"),
            Err(ResolutionError::Provider(_))
        ));
    }
}
