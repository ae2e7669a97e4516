//! OpenSubtitles Client
//!
//! Searches the OpenSubtitles REST endpoint, downloads the best-rated match
//! and converts it to WebVTT for the player.
//!
//! Subtitle acquisition never fails a stream: every error is reported to the
//! caller, who carries on without subtitles.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tracing::{debug, info};
use url::Url;

/// Public OpenSubtitles REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://rest.opensubtitles.org";

/// The REST endpoint rejects requests without a registered agent
const USER_AGENT: &str = "MovieStreamer v1.0";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What to look subtitles up by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleQuery {
    pub title: String,
    pub year: Option<u16>,
    pub imdb_id: Option<String>,
    /// OpenSubtitles language id, e.g. "eng"
    pub language: String,
}

impl SubtitleQuery {
    pub fn new(title: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            year: None,
            imdb_id: None,
            language: language.into(),
        }
    }

    /// IMDB id when known, otherwise "title year"
    pub fn search_term(&self) -> String {
        match (&self.imdb_id, self.year) {
            (Some(imdb), _) if !imdb.trim().is_empty() => imdb.trim().to_string(),
            (_, Some(year)) => format!("{} {}", self.title, year),
            _ => self.title.clone(),
        }
    }
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleCandidate {
    pub file_name: String,
    pub language: String,
    pub rating: f64,
    pub format: String,
    pub download_url: String,
}

/// Raw OpenSubtitles search entry
#[derive(Debug, Deserialize)]
struct RawSubtitle {
    #[serde(rename = "SubFileName", default)]
    sub_file_name: String,
    #[serde(rename = "SubLanguageID", default)]
    sub_language_id: String,
    // Sent as a string ("8.5"), occasionally as a number or empty
    #[serde(rename = "SubRating", default)]
    sub_rating: Option<serde_json::Value>,
    #[serde(rename = "SubFormat", default)]
    sub_format: String,
    #[serde(rename = "SubDownloadLink")]
    sub_download_link: String,
}

fn parse_rating(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Source of WebVTT subtitle tracks
///
/// `status` receives human-readable progress lines while fetching.
#[async_trait]
pub trait SubtitleProvider: Send + Sync {
    async fn fetch(
        &self,
        query: &SubtitleQuery,
        status: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<Option<String>>;
}

/// Subtitle client for the OpenSubtitles REST API
pub struct SubtitleClient {
    base_url: String,
    client: reqwest::Client,
}

impl SubtitleClient {
    /// Create a new subtitle client against the public endpoint
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create with custom base URL (for testing)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Search subtitles, best rated first.
    ///
    /// Entries with equal ratings keep the order the API returned them in.
    pub async fn search(&self, query: &SubtitleQuery) -> Result<Vec<SubtitleCandidate>> {
        let url = format!(
            "{}/search/query-{}/sublanguageid-{}",
            self.base_url,
            urlencoding::encode(&query.search_term()),
            urlencoding::encode(&query.language)
        );
        debug!(%url, "searching subtitles");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Subtitle search request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("OpenSubtitles API error: {}", response.status()));
        }

        let raw: Vec<RawSubtitle> = response
            .json()
            .await
            .context("Failed to parse subtitle search response")?;

        let mut candidates: Vec<SubtitleCandidate> = raw
            .into_iter()
            .map(|s| SubtitleCandidate {
                rating: parse_rating(s.sub_rating.as_ref()),
                file_name: s.sub_file_name,
                language: s.sub_language_id,
                format: s.sub_format,
                download_url: s.sub_download_link,
            })
            .collect();
        candidates.sort_by(|a, b| b.rating.total_cmp(&a.rating));

        Ok(candidates)
    }

    /// Download one candidate and convert it to WebVTT
    pub async fn download(&self, candidate: &SubtitleCandidate) -> Result<String> {
        let response = self
            .client
            .get(&candidate.download_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Subtitle download request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Failed to download subtitle: {}",
                response.status()
            ));
        }

        let bytes = response.bytes().await?;
        let raw = if candidate.download_url.ends_with(".gz") {
            gunzip(&bytes).context("Failed to decompress subtitle")?
        } else {
            bytes.to_vec()
        };

        let srt = String::from_utf8_lossy(&raw);
        Ok(Self::srt_to_webvtt(&srt))
    }

    /// Convert SRT content to WebVTT format
    ///
    /// Converts SRT timestamps (00:00:00,000) to WebVTT format (00:00:00.000)
    /// and adds the required WEBVTT header.
    pub fn srt_to_webvtt(srt: &str) -> String {
        let mut webvtt = String::from("WEBVTT\n\n");

        // Process line by line, only converting timestamps (not dialogue text)
        for line in srt.trim_start_matches('\u{feff}').lines() {
            let converted = if line.contains(" --> ") {
                line.replace(',', ".")
            } else {
                line.to_string()
            };
            webvtt.push_str(&converted);
            webvtt.push('\n');
        }

        webvtt
    }
}

impl Default for SubtitleClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubtitleProvider for SubtitleClient {
    async fn fetch(
        &self,
        query: &SubtitleQuery,
        status: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<Option<String>> {
        let candidates = self.search(query).await?;
        let Some(best) = candidates.first() else {
            return Ok(None);
        };

        info!(file = %best.file_name, rating = best.rating, "downloading subtitle");
        status("Downloading subtitle...");
        self.download(best).await.map(Some)
    }
}

fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// A subtitle track on disk, deleted when the session ends
#[derive(Debug)]
pub struct SubtitleArtifact {
    path: TempPath,
    url: Url,
}

impl SubtitleArtifact {
    /// Write `webvtt` to a fresh `subtitle_*.vtt` file inside `dir`.
    pub fn write(dir: &Path, webvtt: &str) -> io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("subtitle_")
            .suffix(".vtt")
            .tempfile_in(dir)?;
        file.write_all(webvtt.as_bytes())?;
        file.flush()?;

        let path = file.into_temp_path();
        let url = Url::from_file_path(&path).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not an absolute path", path.display()),
            )
        })?;
        Ok(Self { path, url })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `file://` URL of the track
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Delete the file, reporting failure.
    pub fn close(self) -> io::Result<()> {
        self.path.close()
    }
}
