//! Local Player - mpv/VLC playback
//!
//! Launches the external player on the stream URL and supervises it.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info};

use super::process::{supervised_command, terminate};

/// Supported local players
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerType {
    /// mpv media player (default)
    #[default]
    Mpv,
    /// VLC media player
    Vlc,
}

impl PlayerType {
    /// Get the command name for this player
    pub fn command(&self) -> &'static str {
        match self {
            PlayerType::Vlc => {
                // On macOS, VLC is an app bundle - check for it
                #[cfg(target_os = "macos")]
                if std::path::Path::new("/Applications/VLC.app").exists() {
                    return "/Applications/VLC.app/Contents/MacOS/VLC";
                }
                "vlc"
            }
            PlayerType::Mpv => "mpv",
        }
    }

    /// Get a display name for this player
    pub fn display_name(&self) -> &'static str {
        match self {
            PlayerType::Vlc => "VLC",
            PlayerType::Mpv => "mpv",
        }
    }

    /// Where to get the player when it is missing
    pub fn install_url(&self) -> &'static str {
        match self {
            PlayerType::Mpv => "https://mpv.io/installation/",
            PlayerType::Vlc => "https://www.videolan.org/vlc/",
        }
    }
}

impl std::fmt::Display for PlayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl std::str::FromStr for PlayerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mpv" => Ok(PlayerType::Mpv),
            "vlc" => Ok(PlayerType::Vlc),
            other => Err(format!("unknown player '{}'", other)),
        }
    }
}

/// Errors from local player operations
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("{player} player not found. Please download and install it from {install_url}")]
    NotFound {
        player: String,
        install_url: &'static str,
    },
    #[error("Failed to start player: {0}")]
    StartFailed(#[from] io::Error),
    #[error("Subtitle file not found: {0}")]
    SubtitleNotFound(String),
}

impl PlayerError {
    /// Remediation pointer for a missing player
    pub fn install_url(&self) -> Option<&'static str> {
        match self {
            PlayerError::NotFound { install_url, .. } => Some(install_url),
            _ => None,
        }
    }
}

/// Local player for streaming content
#[derive(Debug, Clone, Default)]
pub struct LocalPlayer {
    player_type: PlayerType,
    program: Option<PathBuf>,
    leading_args: Vec<String>,
}

impl LocalPlayer {
    /// Create a new local player with the specified type
    pub fn new(player_type: PlayerType) -> Self {
        Self {
            player_type,
            program: None,
            leading_args: Vec::new(),
        }
    }

    /// Create an mpv player
    pub fn mpv() -> Self {
        Self::new(PlayerType::Mpv)
    }

    /// Create a VLC player
    pub fn vlc() -> Self {
        Self::new(PlayerType::Vlc)
    }

    /// Run `program` instead of the player's usual binary
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Arguments placed before the player flags
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    fn program(&self) -> OsString {
        match &self.program {
            Some(path) => path.clone().into_os_string(),
            None => OsString::from(self.player_type.command()),
        }
    }

    /// Player flags for `stream_url`, excluding any leading arguments
    pub fn args(&self, stream_url: &str, title: &str, subtitle_path: Option<&Path>) -> Vec<String> {
        let mut args = vec![stream_url.to_string()];
        match self.player_type {
            PlayerType::Mpv => {
                args.extend([
                    format!("--title={}", title),
                    "--fs".to_string(),
                    "--cache=yes".to_string(),
                    "--demuxer-max-bytes=50M".to_string(),
                    "--demuxer-max-back-bytes=25M".to_string(),
                    "--cache-secs=5".to_string(),
                    "--force-seekable=yes".to_string(),
                ]);
                if let Some(sub_path) = subtitle_path {
                    args.push(format!("--sub-file={}", sub_path.display()));
                    args.push("--sub-auto=fuzzy".to_string());
                }
            }
            PlayerType::Vlc => {
                args.extend([
                    format!("--meta-title={}", title),
                    "--fullscreen".to_string(),
                    "--network-caching=5000".to_string(),
                    "--no-video-title-show".to_string(),
                ]);
                if let Some(sub_path) = subtitle_path {
                    args.push(format!("--sub-file={}", sub_path.display()));
                }
            }
        }
        args
    }

    /// Spawn the player on `stream_url`.
    ///
    /// A missing binary is reported as [`PlayerError::NotFound`] with the
    /// install URL; the caller decides what happens to the transfer.
    pub fn launch(
        &self,
        stream_url: &str,
        title: &str,
        subtitle_path: Option<&Path>,
    ) -> Result<PlaybackHandle, PlayerError> {
        if let Some(sub_path) = subtitle_path {
            if !sub_path.exists() {
                return Err(PlayerError::SubtitleNotFound(
                    sub_path.display().to_string(),
                ));
            }
        }

        let program = self.program();
        let mut child = supervised_command(&program)
            .args(&self.leading_args)
            .args(self.args(stream_url, title, subtitle_path))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    PlayerError::NotFound {
                        player: self.player_type.display_name().to_string(),
                        install_url: self.player_type.install_url(),
                    }
                } else {
                    PlayerError::StartFailed(e)
                }
            })?;

        let pid = child.id();
        info!(?pid, player = %self.player_type, "player started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "moviestream::player", "{}", line);
                }
            });
        }

        Ok(PlaybackHandle { child, pid })
    }
}

/// A running player process
pub struct PlaybackHandle {
    child: Child,
    pid: Option<u32>,
}

impl PlaybackHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the player to exit for any reason.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Close the player: SIGTERM, then kill after `grace`.
    pub async fn stop(&mut self, grace: Duration) -> io::Result<()> {
        let status = terminate(&mut self.child, grace).await?;
        debug!(pid = ?self.pid, ?status, "player stopped");
        Ok(())
    }
}

/// Bounded relaunch policy for a player that exits unsuccessfully while the
/// transfer is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    /// Never relaunch
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Delay before the next launch, or `None` when playback is over.
    ///
    /// A clean exit means the user closed the player and is never retried.
    pub fn next_attempt(&self, exited_cleanly: bool, retries_used: u32) -> Option<Duration> {
        if exited_cleanly || retries_used >= self.max_retries {
            None
        } else {
            Some(self.backoff)
        }
    }
}
