//! YTS catalog client
//!
//! Searches the YTS `list_movies` endpoint, most-seeded first.
//! Each movie carries its torrent variants (quality, hash, size, seeds).

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::models::{Movie, SearchPage};

/// Public YTS API
pub const DEFAULT_BASE_URL: &str = "https://yts.lt/api/v2";

/// Page size the API uses when it does not report one
const DEFAULT_PAGE_LIMIT: u32 = 20;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// YTS API envelope
#[derive(Debug, Deserialize)]
struct YtsResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
    data: Option<YtsData>,
}

#[derive(Debug, Deserialize)]
struct YtsData {
    #[serde(default)]
    movie_count: u32,
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    movies: Vec<Movie>,
}

/// `ceil(movie_count / limit)`, at least 1
fn total_pages(movie_count: u32, limit: Option<u32>) -> u32 {
    let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_PAGE_LIMIT);
    if movie_count == 0 {
        1
    } else {
        movie_count.div_ceil(limit)
    }
}

/// YTS catalog client
pub struct YtsClient {
    base_url: String,
    client: reqwest::Client,
}

impl YtsClient {
    /// Create a new YTS client with default settings
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Create a client with a custom base URL (for testing)
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Search movies by title, sorted by seeds
    pub async fn search(&self, query: &str, page: u32) -> Result<SearchPage> {
        let page = page.max(1);
        let url = format!(
            "{}/list_movies.json?query_term={}&sort_by=seeds&page={}",
            self.base_url,
            urlencoding::encode(query),
            page
        );

        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("Failed to fetch from YTS")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("YTS returned HTTP {}", status);
        }

        let text = response
            .text()
            .await
            .context("Failed to read response body")?;

        let body: YtsResponse =
            serde_json::from_str(&text).context("Failed to parse JSON response")?;

        if body.status.as_deref().is_some_and(|s| s != "ok") {
            anyhow::bail!(
                "YTS error: {}",
                body.status_message.as_deref().unwrap_or("unknown")
            );
        }

        let Some(data) = body.data else {
            return Ok(SearchPage {
                movies: Vec::new(),
                page,
                total_pages: 1,
            });
        };

        Ok(SearchPage {
            total_pages: total_pages(data.movie_count, data.limit),
            movies: data.movies,
            page,
        })
    }

    /// Like [`search`](Self::search), but a failure yields an empty first page.
    pub async fn search_lenient(&self, query: &str, page: u32) -> SearchPage {
        match self.search(query, page).await {
            Ok(result) => result,
            Err(e) => {
                warn!("catalog search failed: {:#}", e);
                SearchPage::empty()
            }
        }
    }
}

impl Default for YtsClient {
    fn default() -> Self {
        Self::new()
    }
}
