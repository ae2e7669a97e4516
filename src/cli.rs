//! CLI - Command Line Interface for MovieStream
//!
//! Every action is scriptable and all output is JSON-parseable.
//!
//! # Examples
//!
//! ```bash
//! # Search the catalog
//! moviestream search "big buck bunny" --json
//!
//! # Stream a release by info hash
//! moviestream stream dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c --title "Big Buck Bunny"
//!
//! # Search, pick and play in one go
//! moviestream watch "sintel" --quality 1080p
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::PathBuf;

use moviestream::models::Quality;
use moviestream::stream::{PlayerType, StreamError};

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for CLI operations (semantic for scripting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// General error
    Error = 1,
    /// Invalid arguments
    InvalidArgs = 2,
    /// Network error
    NetworkError = 3,
    /// Player binary not found
    PlayerMissing = 4,
    /// No movie or release matched
    NoStreams = 5,
    /// Transfer engine failed
    StreamFailed = 6,
    /// No peers in time
    ReadinessTimeout = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> std::process::ExitCode {
        std::process::ExitCode::from(code as u8)
    }
}

impl From<&StreamError> for ExitCode {
    fn from(err: &StreamError) -> ExitCode {
        match err {
            StreamError::InvalidRequest(_) => ExitCode::InvalidArgs,
            StreamError::ReadinessTimeout => ExitCode::ReadinessTimeout,
            StreamError::Workspace(_)
            | StreamError::Spawn(_)
            | StreamError::BridgeExited { .. }
            | StreamError::UntrustedUrl(_)
            | StreamError::TransferFailed(_) => ExitCode::StreamFailed,
            StreamError::Superseded | StreamError::Stopped | StreamError::OrchestratorGone => {
                ExitCode::Error
            }
        }
    }
}

// =============================================================================
// Main CLI Structure
// =============================================================================

/// MovieStream - watch torrents while they download
#[derive(Parser, Debug)]
#[command(
    name = "moviestream",
    version,
    author = "Gorka & Hermes",
    about = "Stream torrent-backed movies into mpv or VLC",
    long_about = "Search the YTS catalog, pick a release and watch it in mpv or VLC \
                  while it is still downloading. Subtitles are fetched from \
                  OpenSubtitles when available.",
    after_help = "EXAMPLES:\n\
                  moviestream search \"big buck bunny\"         Search the catalog\n\
                  moviestream watch sintel -Q 1080p           Search and play the top hit\n\
                  moviestream stream <hash> -t \"Sintel\"       Play a known release\n\
                  moviestream subtitles Sintel --year 2010    List subtitles"
)]
pub struct Cli {
    /// Output format as JSON (default for non-TTY)
    #[arg(long, short = 'j', global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Check if JSON output should be used
    pub fn should_json(&self) -> bool {
        self.json || !std::io::stdout().is_terminal()
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search the movie catalog
    #[command(visible_alias = "s")]
    Search(SearchCmd),

    /// Search for subtitles
    #[command(visible_alias = "sub")]
    Subtitles(SubtitlesCmd),

    /// Stream a release by info hash or magnet link
    #[command(visible_alias = "st")]
    Stream(StreamCmd),

    /// Search, pick a release and stream it
    #[command(visible_alias = "w")]
    Watch(WatchCmd),

    /// Transfer bridge worker (started by `stream`)
    #[command(hide = true)]
    Bridge(BridgeCmd),
}

// =============================================================================
// Search Command
// =============================================================================

/// Search movies by title
#[derive(Args, Debug)]
pub struct SearchCmd {
    /// Search query (title, keywords)
    #[arg(required = true)]
    pub query: String,

    /// Result page (1-based)
    #[arg(long, short = 'p', default_value = "1")]
    pub page: u32,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityFilter {
    #[value(name = "2160p", alias = "4k")]
    Q2160p,
    #[value(name = "1080p")]
    Q1080p,
    #[value(name = "720p")]
    Q720p,
    #[value(name = "480p")]
    Q480p,
}

impl From<QualityFilter> for Quality {
    fn from(filter: QualityFilter) -> Quality {
        match filter {
            QualityFilter::Q2160p => Quality::UHD4K,
            QualityFilter::Q1080p => Quality::FHD1080p,
            QualityFilter::Q720p => Quality::HD720p,
            QualityFilter::Q480p => Quality::SD480p,
        }
    }
}

impl std::fmt::Display for QualityFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityFilter::Q2160p => write!(f, "2160p"),
            QualityFilter::Q1080p => write!(f, "1080p"),
            QualityFilter::Q720p => write!(f, "720p"),
            QualityFilter::Q480p => write!(f, "480p"),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerChoice {
    Mpv,
    Vlc,
}

impl From<PlayerChoice> for PlayerType {
    fn from(choice: PlayerChoice) -> PlayerType {
        match choice {
            PlayerChoice::Mpv => PlayerType::Mpv,
            PlayerChoice::Vlc => PlayerType::Vlc,
        }
    }
}

// =============================================================================
// Subtitles Command
// =============================================================================

/// Search OpenSubtitles, best rated first
#[derive(Args, Debug)]
pub struct SubtitlesCmd {
    /// Movie title
    #[arg(required = true)]
    pub title: String,

    /// Release year
    #[arg(long, short = 'y')]
    pub year: Option<u16>,

    /// IMDB ID (e.g., tt1727587); takes precedence over title and year
    #[arg(long)]
    pub imdb: Option<String>,

    /// OpenSubtitles language id (default from config)
    #[arg(long, short = 'l')]
    pub lang: Option<String>,

    /// Maximum number of results
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

// =============================================================================
// Stream Command
// =============================================================================

/// Stream one release
#[derive(Args, Debug)]
pub struct StreamCmd {
    /// Info hash or magnet link
    #[arg(required = true)]
    pub identifier: String,

    /// Title shown in the player
    #[arg(long, short = 't')]
    pub title: String,

    /// Quality label, informational
    #[arg(long, short = 'Q', value_enum)]
    pub quality: Option<QualityFilter>,

    /// Skip subtitle lookup
    #[arg(long)]
    pub no_subtitles: bool,

    /// Release year, for subtitle lookup
    #[arg(long, short = 'y')]
    pub year: Option<u16>,

    /// IMDB ID, for subtitle lookup
    #[arg(long)]
    pub imdb: Option<String>,

    /// Player (default from config)
    #[arg(long, short = 'p', value_enum)]
    pub player: Option<PlayerChoice>,
}

// =============================================================================
// Watch Command
// =============================================================================

/// Search and stream the chosen result
#[derive(Args, Debug)]
pub struct WatchCmd {
    /// Search query
    #[arg(required = true)]
    pub query: String,

    /// Preferred quality (default from config, else best available)
    #[arg(long, short = 'Q', value_enum)]
    pub quality: Option<QualityFilter>,

    /// Result to play (0-based, from `search`)
    #[arg(long, short = 'i', default_value = "0")]
    pub index: usize,

    /// Skip subtitle lookup
    #[arg(long)]
    pub no_subtitles: bool,

    /// Player (default from config)
    #[arg(long, short = 'p', value_enum)]
    pub player: Option<PlayerChoice>,
}

// =============================================================================
// Bridge Command
// =============================================================================

/// Join the swarm and serve the payload on loopback
#[derive(Args, Debug)]
pub struct BridgeCmd {
    /// Magnet link
    #[arg(required = true)]
    pub magnet: String,

    /// Port for the range server
    #[arg(long)]
    pub port: u16,

    /// Download directory
    #[arg(long)]
    pub out: PathBuf,
}

// =============================================================================
// JSON Output Types
// =============================================================================

/// Generic JSON output wrapper with status
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonOutput<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl<T: Serialize> JsonOutput<T> {
    /// Create success output with data
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            exit_code: 0,
        }
    }

    /// Create error output (no data)
    pub fn error_msg(msg: impl Into<String>, code: ExitCode) -> JsonOutput<()> {
        JsonOutput::<()> {
            data: None,
            error: Some(msg.into()),
            exit_code: code.into(),
        }
    }
}

/// Stream finished response
#[derive(Debug, Serialize)]
pub struct StreamResponse {
    pub status: &'static str,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Output handler for consistent formatting
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.should_json(),
            quiet: cli.quiet,
        }
    }

    /// Print success data
    pub fn print<T: Serialize>(&self, data: T) -> anyhow::Result<()> {
        if self.json {
            let output = JsonOutput::success(data);
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            // For non-JSON, caller should handle formatting
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Ok(())
    }

    /// Print one compact JSON line (event streams)
    pub fn print_line<T: Serialize>(&self, data: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(data)?);
        Ok(())
    }

    /// Print error and return exit code
    pub fn error(&self, msg: impl Into<String>, code: ExitCode) -> ExitCode {
        let msg = msg.into();
        if self.json {
            let output = JsonOutput::<()>::error_msg(&msg, code);
            if let Ok(json) = serde_json::to_string_pretty(&output) {
                eprintln!("{}", json);
            }
        } else if !self.quiet {
            eprintln!("Error: {}", msg);
        }
        code
    }

    /// Print info message (suppressed in quiet mode)
    pub fn info(&self, msg: impl std::fmt::Display) {
        if !self.quiet && !self.json {
            eprintln!("{}", msg);
        }
    }
}

// =============================================================================
// IMDB ID Validation
// =============================================================================

/// Validate IMDB ID format (tt followed by digits)
pub fn validate_imdb_id(id: &str) -> Result<&str, &'static str> {
    if id.starts_with("tt") && id.len() >= 9 && id[2..].chars().all(|c| c.is_ascii_digit()) {
        Ok(id)
    } else {
        Err("Invalid IMDB ID format (expected tt followed by 7+ digits)")
    }
}

// =============================================================================
// Tests
// =============================================================================
