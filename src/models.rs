//! Data structures and types for MovieStream
//!
//! Shared models organized by domain:
//! - **Catalog**: YTS movie listings and their torrent variants
//! - **Stream**: what the orchestrator is asked to play

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Catalog Models (YTS)
// =============================================================================

/// Video quality classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Quality {
    UHD4K,
    FHD1080p,
    HD720p,
    SD480p,
    #[default]
    Unknown,
}

impl Quality {
    /// Parse quality from a string (e.g., "2160p", "1080p", "720p")
    pub fn from_str_loose(s: &str) -> Self {
        let s_lower = s.to_lowercase();
        if s_lower.contains("4k") || s_lower.contains("2160p") || s_lower.contains("uhd") {
            Quality::UHD4K
        } else if s_lower.contains("1080p") || s_lower.contains("fhd") {
            Quality::FHD1080p
        } else if s_lower.contains("720p") || s_lower.contains("hd") && !s_lower.contains("hdcam") {
            Quality::HD720p
        } else if s_lower.contains("480p") || s_lower.contains("sd") {
            Quality::SD480p
        } else {
            Quality::Unknown
        }
    }

    /// Quality ranking for sorting (higher = better)
    pub fn rank(&self) -> u8 {
        match self {
            Quality::UHD4K => 4,
            Quality::FHD1080p => 3,
            Quality::HD720p => 2,
            Quality::SD480p => 1,
            Quality::Unknown => 0,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::UHD4K => write!(f, "4K"),
            Quality::FHD1080p => write!(f, "1080p"),
            Quality::HD720p => write!(f, "720p"),
            Quality::SD480p => write!(f, "480p"),
            Quality::Unknown => write!(f, "???"),
        }
    }
}

impl Ord for Quality {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for Quality {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One downloadable release of a movie
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentVariant {
    /// BitTorrent info hash
    pub hash: String,
    /// Human label as listed, e.g. "1080p"
    pub quality: String,
    /// Release kind, e.g. "web" or "bluray"
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub seeds: u32,
    #[serde(default)]
    pub peers: u32,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl TorrentVariant {
    /// Parsed quality of this release
    pub fn quality_class(&self) -> Quality {
        Quality::from_str_loose(&self.quality)
    }

    /// Generate magnet URL for this release
    pub fn to_magnet(&self, display_name: &str) -> String {
        magnet_for_hash(&self.hash, display_name)
    }

    /// Format size for display
    pub fn format_size(&self) -> String {
        if !self.size.is_empty() {
            return self.size.clone();
        }
        format_size(self.size_bytes)
    }
}

impl fmt::Display for TorrentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} 👤{}",
            self.quality,
            self.kind,
            self.format_size(),
            self.seeds
        )
    }
}

/// A catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movie {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub rating: f32,
    #[serde(default)]
    pub imdb_code: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub medium_cover_image: Option<String>,
    #[serde(default)]
    pub large_cover_image: Option<String>,
    #[serde(default)]
    pub torrents: Vec<TorrentVariant>,
}

impl Movie {
    /// Pick a release to stream.
    ///
    /// With a quality filter, the best-seeded release of that quality; without
    /// one, the best quality, then the most seeds.
    pub fn pick_variant(&self, quality: Option<Quality>) -> Option<&TorrentVariant> {
        match quality {
            Some(q) => self
                .torrents
                .iter()
                .filter(|t| t.quality_class() == q)
                .max_by_key(|t| t.seeds),
            None => self
                .torrents
                .iter()
                .max_by_key(|t| (t.quality_class(), t.seeds)),
        }
    }

    /// Metadata used for subtitle lookup
    pub fn metadata(&self) -> MovieMetadata {
        MovieMetadata {
            title: self.title.clone(),
            year: self.year,
            imdb_code: self.imdb_code.clone(),
        }
    }
}

impl fmt::Display for Movie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let year_str = self.year.map(|y| format!(" ({})", y)).unwrap_or_default();
        write!(f, "{}{} ⭐ {:.1}", self.title, year_str, self.rating)
    }
}

/// One page of catalog results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPage {
    pub movies: Vec<Movie>,
    pub page: u32,
    pub total_pages: u32,
}

impl SearchPage {
    /// What the catalog reports when it cannot be reached
    pub fn empty() -> Self {
        Self {
            movies: Vec::new(),
            page: 1,
            total_pages: 1,
        }
    }
}

// =============================================================================
// Stream Models
// =============================================================================

/// Descriptive metadata passed along with a stream request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovieMetadata {
    pub title: String,
    pub year: Option<u16>,
    pub imdb_code: Option<String>,
}

/// A request to stream one torrent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Info hash or full magnet URI
    pub identifier: String,
    /// Title shown by the player
    pub title: String,
    pub quality: Option<String>,
    pub use_subtitles: bool,
    pub metadata: Option<MovieMetadata>,
}

impl StreamRequest {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            quality: None,
            use_subtitles: false,
            metadata: None,
        }
    }

    /// Magnet URI for the transfer engine.
    ///
    /// A magnet URI is used as given; a bare info hash is wrapped in one.
    pub fn magnet(&self) -> Result<String, String> {
        let id = self.identifier.trim();
        if id.starts_with("magnet:?") {
            return Ok(id.to_string());
        }
        if is_info_hash(id) {
            return Ok(magnet_for_hash(id, &self.title));
        }
        Err(format!(
            "'{}' is neither a magnet URI nor a BitTorrent info hash",
            id
        ))
    }
}

/// 40 hex digits or 32 base32 characters
pub fn is_info_hash(s: &str) -> bool {
    regex::Regex::new(r"^(?:[0-9a-fA-F]{40}|[A-Za-z2-7]{32})$")
        .map(|re| re.is_match(s))
        .unwrap_or(false)
}

/// `magnet:?xt=urn:btih:<hash>&dn=<title>`
pub fn magnet_for_hash(hash: &str, display_name: &str) -> String {
    format!(
        "magnet:?xt=urn:btih:{}&dn={}",
        hash,
        urlencoding::encode(display_name)
    )
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Format a byte count as GB/MB/KB
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.0} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes > 0 {
        format!("{} KB", bytes / 1024)
    } else {
        "? GB".to_string()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";

    fn variant(quality: &str, seeds: u32) -> TorrentVariant {
        TorrentVariant {
            hash: HASH.to_string(),
            quality: quality.to_string(),
            kind: "web".to_string(),
            seeds,
            peers: 0,
            size: String::new(),
            size_bytes: 0,
        }
    }

    fn movie(torrents: Vec<TorrentVariant>) -> Movie {
        Movie {
            id: 1,
            title: "Big Buck Bunny".to_string(),
            year: Some(2008),
            rating: 6.5,
            imdb_code: Some("tt1254207".to_string()),
            summary: None,
            medium_cover_image: None,
            large_cover_image: None,
            torrents,
        }
    }

    // -------------------------------------------------------------------------
    // Quality Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_quality_from_str() {
        assert_eq!(Quality::from_str_loose("2160p"), Quality::UHD4K);
        assert_eq!(Quality::from_str_loose("1080p"), Quality::FHD1080p);
        assert_eq!(Quality::from_str_loose("720p"), Quality::HD720p);
        assert_eq!(Quality::from_str_loose("480p"), Quality::SD480p);
        assert_eq!(Quality::from_str_loose("3D"), Quality::Unknown);
        assert_eq!(Quality::from_str_loose("HDCAM"), Quality::Unknown);
    }

    #[test]
    fn test_quality_ordering() {
        assert!(Quality::UHD4K > Quality::FHD1080p);
        assert!(Quality::FHD1080p > Quality::HD720p);
        assert!(Quality::SD480p > Quality::Unknown);
    }

    // -------------------------------------------------------------------------
    // Catalog Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_pick_variant_by_quality() {
        let m = movie(vec![
            variant("720p", 50),
            variant("1080p", 10),
            variant("1080p", 30),
        ]);
        let picked = m.pick_variant(Some(Quality::FHD1080p)).unwrap();
        assert_eq!(picked.seeds, 30);
        assert!(m.pick_variant(Some(Quality::UHD4K)).is_none());
    }

    #[test]
    fn test_pick_variant_default_prefers_quality() {
        let m = movie(vec![variant("720p", 500), variant("1080p", 3)]);
        assert_eq!(m.pick_variant(None).unwrap().quality, "1080p");
        assert!(movie(vec![]).pick_variant(None).is_none());
    }

    #[test]
    fn test_movie_display() {
        assert_eq!(movie(vec![]).to_string(), "Big Buck Bunny (2008) ⭐ 6.5");
    }

    #[test]
    fn test_yts_movie_deserialize() {
        let json = r#"{
            "id": 7,
            "title": "Sintel",
            "year": 2010,
            "rating": 7.4,
            "imdb_code": "tt1727587",
            "torrents": [
                {"hash": "ABC", "quality": "1080p", "type": "web", "seeds": 12, "peers": 3, "size": "1.1 GB", "size_bytes": 1181116006}
            ]
        }"#;
        let m: Movie = serde_json::from_str(json).unwrap();
        assert_eq!(m.year, Some(2010));
        assert_eq!(m.torrents[0].kind, "web");
        assert_eq!(m.torrents[0].quality_class(), Quality::FHD1080p);
    }

    // -------------------------------------------------------------------------
    // StreamRequest Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_magnet_from_hash() {
        let req = StreamRequest::new(HASH, "Big Buck Bunny");
        assert_eq!(
            req.magnet().unwrap(),
            format!("magnet:?xt=urn:btih:{}&dn=Big%20Buck%20Bunny", HASH)
        );
    }

    #[test]
    fn test_magnet_passthrough() {
        let uri = format!("magnet:?xt=urn:btih:{}&tr=udp%3A%2F%2Ftracker", HASH);
        let req = StreamRequest::new(format!("  {}  ", uri), "x");
        assert_eq!(req.magnet().unwrap(), uri);
    }

    #[test]
    fn test_magnet_rejects_garbage() {
        assert!(StreamRequest::new("not-a-hash", "x").magnet().is_err());
        assert!(StreamRequest::new("", "x").magnet().is_err());
    }

    #[test]
    fn test_is_info_hash() {
        assert!(is_info_hash(HASH));
        assert!(is_info_hash(&HASH.to_uppercase()));
        assert!(is_info_hash("MFRGGZDFMZTWQ2LKNNWG23TPOBYXE43U"));
        assert!(!is_info_hash(&HASH[..39]));
        assert!(!is_info_hash("zz8255ecdc7ca55fb0bbf81323d87062db1f6d1c"));
    }

    // -------------------------------------------------------------------------
    // Utility Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.0 GB");
        assert_eq!(format_size(700 * 1024 * 1024), "700 MB");
        assert_eq!(format_size(4096), "4 KB");
        assert_eq!(format_size(0), "? GB");
    }
}
