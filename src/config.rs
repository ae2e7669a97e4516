//! Configuration management for MovieStream
//!
//! Config is stored at ~/.config/moviestream/config.toml. Every key is
//! optional; a missing file means defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::yts;
use crate::stream::subtitles;
use crate::stream::{BridgeCommand, LocalPlayer, PlayerType, RetryPolicy, SessionConfig};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Player to launch (mpv or vlc)
    pub player: PlayerType,
    /// Player binary, when not on PATH
    pub player_path: Option<PathBuf>,
    /// External transfer engine (e.g. webtorrent); the built-in bridge when unset
    pub bridge_path: Option<PathBuf>,
    /// Arguments placed before the magnet when `bridge_path` is set
    pub bridge_args: Vec<String>,
    pub readiness_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub player_launch_delay_secs: u64,
    /// `[first, last)` ports the bridge may listen on
    pub port_range: [u16; 2],
    /// OpenSubtitles language id
    pub subtitle_language: String,
    pub playback_retries: u32,
    pub playback_retry_backoff_ms: u64,
    /// Preferred quality (2160p, 1080p, 720p, 480p)
    pub preferred_quality: Option<String>,
    pub catalog_url: String,
    pub subtitle_url: String,
    /// Where download directories are created; the OS temp dir when unset
    pub temp_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            player: PlayerType::Mpv,
            player_path: None,
            bridge_path: None,
            bridge_args: Vec::new(),
            readiness_timeout_secs: 60,
            grace_period_secs: 3,
            player_launch_delay_secs: 3,
            port_range: [8000, 9000],
            subtitle_language: "eng".to_string(),
            playback_retries: 2,
            playback_retry_backoff_ms: 1500,
            preferred_quality: None,
            catalog_url: yts::DEFAULT_BASE_URL.to_string(),
            subtitle_url: subtitles::DEFAULT_BASE_URL.to_string(),
            temp_dir: None,
        }
    }
}

impl Config {
    /// Get config file path (~/.config/moviestream/config.toml)
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("moviestream").join("config.toml"))
    }

    /// Load config from the default location, or return default if not found
    pub fn load() -> Result<Self> {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from `path`. A missing file yields defaults; a malformed
    /// one is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let config: Self =
            toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        let [first, last] = self.port_range;
        if first == 0 || first >= last {
            bail!("port_range must be [first, last) with 0 < first < last, got [{}, {}]", first, last);
        }
        if self.readiness_timeout_secs == 0 {
            bail!("readiness_timeout_secs must be positive");
        }
        Ok(())
    }

    /// The player this config selects
    pub fn local_player(&self) -> LocalPlayer {
        let player = LocalPlayer::new(self.player);
        match &self.player_path {
            Some(path) => player.with_program(path),
            None => player,
        }
    }

    /// How to start the transfer bridge
    pub fn bridge_command(&self) -> Result<BridgeCommand> {
        match &self.bridge_path {
            Some(path) => Ok(BridgeCommand::with_args(path, self.bridge_args.clone())),
            None => BridgeCommand::builtin().context("Could not locate the moviestream executable"),
        }
    }

    /// Orchestrator settings for this config
    pub fn session_config(&self) -> Result<SessionConfig> {
        self.validate()?;
        let mut config = SessionConfig::new(self.bridge_command()?, self.local_player());
        config.port_range = self.port_range[0]..self.port_range[1];
        config.readiness_timeout = Duration::from_secs(self.readiness_timeout_secs);
        config.grace_period = Duration::from_secs(self.grace_period_secs);
        config.player_launch_delay = Duration::from_secs(self.player_launch_delay_secs);
        config.retry = RetryPolicy {
            max_retries: self.playback_retries,
            backoff: Duration::from_millis(self.playback_retry_backoff_ms),
        };
        config.temp_root = self.temp_dir.clone();
        config.subtitle_language = self.subtitle_language.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.player, PlayerType::Mpv);
        assert!(config.bridge_path.is_none());
        assert_eq!(config.port_range, [8000, 9000]);
        assert_eq!(config.readiness_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            player = "vlc"
            readiness_timeout_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.player, PlayerType::Vlc);
        assert_eq!(config.readiness_timeout_secs, 90);
        assert_eq!(config.subtitle_language, "eng");
        assert_eq!(config.playback_retries, 2);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config {
            player: PlayerType::Vlc,
            bridge_path: Some(PathBuf::from("/usr/local/bin/webtorrent")),
            port_range: [9100, 9200],
            ..Config::default()
        };
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port_range = [9000, 8000]\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "player = \"mplayer\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_session_config() {
        let config = Config {
            bridge_path: Some(PathBuf::from("webtorrent")),
            port_range: [9100, 9200],
            player_launch_delay_secs: 0,
            playback_retries: 0,
            ..Config::default()
        };
        let session = config.session_config().unwrap();
        assert_eq!(session.bridge, BridgeCommand::external("webtorrent"));
        assert_eq!(session.port_range, 9100..9200);
        assert_eq!(session.player_launch_delay, Duration::ZERO);
        assert_eq!(session.retry.max_retries, 0);
        assert_eq!(session.subtitle_language, "eng");
    }
}
