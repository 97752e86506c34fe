use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

use crate::cache::{FetchedAudio, Fetcher, SourceKey};
use crate::config::Config;
use crate::error::FetchError;

const READ_CHUNK: usize = 64 * 1024;

/// Descarga + transcodificación a Ogg/Opus con ffmpeg.
///
/// YouTube keys are turned into a direct media URL with `yt-dlp -g` first;
/// every other key is already a URL ffmpeg can open.
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ytdlp: String,
    bitrate: String,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: impl Into<String>, ytdlp: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ytdlp: ytdlp.into(),
            bitrate: "128k".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.ytdlp_path.clone())
    }

    pub fn with_bitrate(mut self, bitrate: impl Into<String>) -> Self {
        self.bitrate = bitrate.into();
        self
    }

    async fn media_url(&self, key: &SourceKey) -> Result<String, FetchError> {
        let Some(video_id) = key.youtube_id() else {
            return Ok(key.as_str().to_string());
        };

        let output = Command::new(&self.ytdlp)
            .args([
                "-f",
                "bestaudio/best",
                "-g",
                "--no-playlist",
                "--no-warnings",
            ])
            .arg(format!("https://www.youtube.com/watch?v={}", video_id))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.ytdlp, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ytdlp_failure(&stderr));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| FetchError::permanent(format!("yt-dlp returned no stream for {}", key)))
    }

    fn spawn_ffmpeg(&self, input: &str) -> Result<(Child, ChildStdout), FetchError> {
        let mut child = Command::new(&self.ffmpeg)
            .args([
                "-nostdin",
                "-hide_banner",
                "-loglevel",
                "error",
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-i",
                input,
                "-vn",
                "-c:a",
                "libopus",
                "-b:a",
                self.bitrate.as_str(),
                "-f",
                "opus",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.ffmpeg, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::transient("ffmpeg stdout not captured"))?;
        Ok((child, stdout))
    }
}

#[async_trait]
impl Fetcher for FfmpegTranscoder {
    async fn fetch(&self, key: &SourceKey) -> Result<FetchedAudio, FetchError> {
        let input = self.media_url(key).await?;
        debug!("🎼 ffmpeg <- {}", key);

        let (child, stdout) = self.spawn_ffmpeg(&input)?;
        info!("🎼 Transcodificando {} a Opus", key);

        let stream = futures::stream::unfold(Some((stdout, child)), |state| async move {
            let (mut stdout, mut child) = state?;
            let mut buf = vec![0u8; READ_CHUNK];
            match stdout.read(&mut buf).await {
                Ok(0) => match child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some((
                        Err(std::io::Error::other(format!("ffmpeg exited with {}", status))),
                        None,
                    )),
                    Err(e) => Some((Err(e), None)),
                },
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some((stdout, child))))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed();

        Ok(FetchedAudio {
            stream,
            size_hint: None,
        })
    }
}

fn spawn_error(binary: &str, err: std::io::Error) -> FetchError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FetchError::permanent(format!("{} not found in PATH", binary))
    } else {
        FetchError::transient(format!("{}: {}", binary, err))
    }
}

fn classify_ytdlp_failure(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    if lower.contains("video unavailable")
        || lower.contains("private video")
        || lower.contains("removed")
        || lower.contains("sign in to confirm your age")
    {
        FetchError::permanent(stderr.trim())
    } else {
        FetchError::transient(stderr.trim())
    }
}
