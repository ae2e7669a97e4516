//! Streaming infrastructure
//!
//! - Session: the orchestrator that supervises one stream at a time
//! - Torrent/Bridge: the transfer bridge process and its supervision
//! - Server/Range/Payload: seekable HTTP over a partially downloaded file
//! - Player: mpv/VLC playback
//! - Subtitles: OpenSubtitles search and WebVTT conversion

pub mod bridge;
pub mod payload;
pub mod player;
pub mod process;
pub mod range;
pub mod server;
pub mod session;
pub mod subtitles;
pub mod swarm;
pub mod torrent;

pub use player::{LocalPlayer, PlayerError, PlayerType, RetryPolicy};
pub use session::{
    SessionConfig, SessionEvent, SessionState, StopOutcome, StreamError, StreamOrchestrator,
    StreamStarted,
};
pub use subtitles::{SubtitleClient, SubtitleProvider, SubtitleQuery};
pub use torrent::BridgeCommand;
