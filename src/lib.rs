//! MovieStream - watch torrents while they download
//!
//! Search a catalog, pick a release and play it in mpv or VLC while the
//! swarm is still delivering it.
//!
//! # Modules
//!
//! - `models` - Catalog entries and stream requests
//! - `api` - Catalog client (YTS)
//! - `stream` - Session orchestrator, transfer bridge, range server, player, subtitles
//! - `config` - TOML configuration
//! - `logging` - tracing setup

pub mod api;
pub mod config;
pub mod logging;
pub mod models;
pub mod stream;

// Re-export commonly used types
pub use models::{Movie, MovieMetadata, Quality, SearchPage, StreamRequest, TorrentVariant};

pub use api::YtsClient;
pub use config::Config;
pub use stream::{
    SessionConfig, SessionEvent, SessionState, StreamError, StreamOrchestrator, StreamStarted,
};
