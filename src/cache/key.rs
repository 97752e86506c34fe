use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::ResolutionError;

/// Extensión de los artefactos transcodificados (Ogg/Opus)
pub const ARTIFACT_EXTENSION: &str = "opus";

/// Identidad determinista de un recurso reproducible.
///
/// Two equal keys are assumed to address byte-identical audio, so the key is
/// also the cache address. YouTube links collapse to `youtube:<video id>` no
/// matter which URL shape they came from; every other URL is normalized
/// (lowercase scheme/host, no fragment, sorted query pairs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(String);

fn youtube_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid video id regex"))
}

impl SourceKey {
    /// Key for a provider-native id, e.g. `SourceKey::provider("youtube", "dQw4w9WgXcQ")`.
    pub fn provider(provider: &str, id: &str) -> Self {
        Self(format!("{}:{}", provider.to_ascii_lowercase(), id))
    }

    /// Normaliza una URL en una clave estable
    pub fn from_url(raw: &str) -> Result<Self, ResolutionError> {
        let mut parsed =
            Url::parse(raw.trim()).map_err(|e| ResolutionError::InvalidQuery(e.to_string()))?;

        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ResolutionError::InvalidQuery(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        if let Some(id) = youtube_video_id(&parsed) {
            return Ok(Self::provider("youtube", &id));
        }

        parsed.set_fragment(None);

        let mut pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        if pairs.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
        }

        // `Url` ya normaliza esquema y host a minúsculas
        Ok(Self(parsed.to_string()))
    }

    /// Rebuild a key from its canonical string (index file, tests).
    pub fn from_canonical(canonical: impl Into<String>) -> Self {
        Self(canonical.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `youtube:<id>` keys carry the video id.
    pub fn youtube_id(&self) -> Option<&str> {
        self.0.strip_prefix("youtube:")
    }

    /// Nombre de archivo direccionado por contenido: sha256 de la clave
    pub fn artifact_file_name(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        format!("{}.{}", hex::encode(digest), ARTIFACT_EXTENSION)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?.trim_start_matches("www.");

    let candidate = match host {
        "youtu.be" => url.path_segments()?.next().map(str::to_string),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("embed") | Some("v") | Some("shorts") | Some("live") => {
                    segments.next().map(str::to_string)
                }
                _ => None,
            }
        }
        _ => None,
    }?;

    youtube_id_regex()
        .is_match(&candidate)
        .then_some(candidate)
}
