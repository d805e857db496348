//! Persistent client configuration model and defaults.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::ConfigError;
use crate::model::TrackId;

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    #[serde(default)]
    /// Backend HTTP endpoints.
    pub backend: BackendConfig,
    #[serde(default)]
    /// Push-channel behavior.
    pub sync: SyncConfig,
    #[serde(default)]
    /// Transport defaults.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Player-state persistence cadence.
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend base URL and REST routes.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_tracks_path")]
    pub tracks_path: String,
    #[serde(default = "default_player_state_path")]
    pub player_state_path: String,
    #[serde(default = "default_download_path")]
    pub download_path: String,
    /// Stream route template; `{id}` is replaced with the track id.
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl BackendConfig {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn stream_url(&self, track_id: TrackId) -> String {
        self.url(&self.stream_path.replace("{id}", &track_id.to_string()))
    }

    /// Absolute cover URL; backend-relative paths are joined onto `base_url`.
    pub fn artwork_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") || path.starts_with("data:")
        {
            path.to_string()
        } else {
            self.url(path)
        }
    }
}

/// Push-channel connection settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SyncConfig {
    #[serde(default = "default_events_path")]
    pub events_path: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_recent_events_capacity")]
    pub recent_events_capacity: usize,
}

/// Transport defaults and seek debounce tuning.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume")]
    pub initial_volume: f32,
    #[serde(default = "default_seek_debounce_ms")]
    pub seek_debounce_ms: u64,
    #[serde(default = "default_seek_debounce_window_secs")]
    pub seek_debounce_window_secs: f64,
    #[serde(default = "default_true")]
    pub media_controls_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PersistenceConfig {
    /// Interval between player-state snapshots while playing.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_true")]
    pub restore_on_startup: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" | "warning" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            tracks_path: default_tracks_path(),
            player_state_path: default_player_state_path(),
            download_path: default_download_path(),
            stream_path: default_stream_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            events_path: default_events_path(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            recent_events_capacity: default_recent_events_capacity(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_volume: default_volume(),
            seek_debounce_ms: default_seek_debounce_ms(),
            seek_debounce_window_secs: default_seek_debounce_window_secs(),
            media_controls_enabled: true,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval_secs(),
            restore_on_startup: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tracks_path() -> String {
    "/api/tracks".to_string()
}

fn default_player_state_path() -> String {
    "/api/player-state".to_string()
}

fn default_download_path() -> String {
    "/api/download".to_string()
}

fn default_stream_path() -> String {
    "/api/tracks/{id}/stream".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_events_path() -> String {
    "/api/events".to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_recent_events_capacity() -> usize {
    10
}

fn default_volume() -> f32 {
    1.0
}

fn default_seek_debounce_ms() -> u64 {
    100
}

fn default_seek_debounce_window_secs() -> f64 {
    1.0
}

fn default_snapshot_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Clamps every field into its valid range.
pub fn sanitize_config(config: Config) -> Config {
    let initial_volume = if config.playback.initial_volume.is_finite() {
        config.playback.initial_volume.clamp(0.0, 1.0)
    } else {
        default_volume()
    };
    let seek_debounce_window_secs = if config.playback.seek_debounce_window_secs.is_finite() {
        config.playback.seek_debounce_window_secs.max(0.0)
    } else {
        default_seek_debounce_window_secs()
    };

    Config {
        backend: BackendConfig {
            base_url: config.backend.base_url.trim().trim_end_matches('/').to_string(),
            request_timeout_secs: config.backend.request_timeout_secs.max(1),
            ..config.backend
        },
        sync: SyncConfig {
            reconnect_delay_secs: config.sync.reconnect_delay_secs.max(1),
            recent_events_capacity: config.sync.recent_events_capacity.max(1),
            ..config.sync
        },
        playback: PlaybackConfig {
            initial_volume,
            seek_debounce_window_secs,
            ..config.playback
        },
        persistence: PersistenceConfig {
            snapshot_interval_secs: config.persistence.snapshot_interval_secs.max(1),
            ..config.persistence
        },
        logging: config.logging,
    }
}

/// Default location: `<config dir>/cadenza/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|root| root.join("cadenza").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Loads the config file, writing a default one first if it does not exist.
pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    };

    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        let text = toml::to_string(&Config::default())
            .map_err(|err| ConfigError::Serialize(err.to_string()))?;
        std::fs::write(path, text).map_err(io_error)?;
    }

    let content = std::fs::read_to_string(path).map_err(io_error)?;
    let config = toml::from_str::<Config>(&content).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    Ok(sanitize_config(config))
}

#[cfg(test)]
mod tests {
    use super::{load_or_create, sanitize_config, Config};

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.backend.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.backend.tracks_path, "/api/tracks");
        assert_eq!(config.backend.player_state_path, "/api/player-state");
        assert_eq!(config.sync.events_path, "/api/events");
        assert_eq!(config.sync.reconnect_delay_secs, 5);
        assert_eq!(config.sync.recent_events_capacity, 10);
        assert_eq!(config.playback.seek_debounce_ms, 100);
        assert!((config.playback.seek_debounce_window_secs - 1.0).abs() < f64::EPSILON);
        assert!((config.playback.initial_volume - 1.0).abs() < f32::EPSILON);
        assert!(config.playback.media_controls_enabled);
        assert_eq!(config.persistence.snapshot_interval_secs, 10);
        assert!(config.persistence.restore_on_startup);
        assert_eq!(config.logging.level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_stream_url_substitutes_track_id() {
        let config = Config::default();
        assert_eq!(
            config.backend.stream_url(42),
            "http://127.0.0.1:8000/api/tracks/42/stream"
        );
        assert_eq!(
            config.backend.artwork_url("/covers/42.jpg"),
            "http://127.0.0.1:8000/covers/42.jpg"
        );
        assert_eq!(
            config.backend.artwork_url("https://cdn.example/42.jpg"),
            "https://cdn.example/42.jpg"
        );
    }

    #[test]
    fn test_sanitize_config_clamps_out_of_range_values() {
        let mut config = Config::default();
        config.backend.base_url = " http://host:9000/ ".to_string();
        config.sync.reconnect_delay_secs = 0;
        config.sync.recent_events_capacity = 0;
        config.playback.initial_volume = 3.0;
        config.playback.seek_debounce_window_secs = f64::NAN;
        config.persistence.snapshot_interval_secs = 0;

        let sanitized = sanitize_config(config);

        assert_eq!(sanitized.backend.base_url, "http://host:9000");
        assert_eq!(sanitized.sync.reconnect_delay_secs, 1);
        assert_eq!(sanitized.sync.recent_events_capacity, 1);
        assert!((sanitized.playback.initial_volume - 1.0).abs() < f32::EPSILON);
        assert!((sanitized.playback.seek_debounce_window_secs - 1.0).abs() < f64::EPSILON);
        assert_eq!(sanitized.persistence.snapshot_interval_secs, 1);
    }

    #[test]
    fn test_partial_config_file_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
[backend]
base_url = "http://music.local"

[sync]
reconnect_delay_secs = 9
"#,
        )
        .expect("partial config should parse");

        assert_eq!(config.backend.base_url, "http://music.local");
        assert_eq!(config.backend.download_path, "/api/download");
        assert_eq!(config.sync.reconnect_delay_secs, 9);
        assert_eq!(config.sync.recent_events_capacity, 10);
        assert_eq!(config.playback.seek_debounce_ms, 100);
    }

    #[test]
    fn test_load_or_create_writes_default_file_then_reads_it_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        let created = load_or_create(&path).expect("default config should be created");
        assert!(path.exists());
        assert_eq!(created, sanitize_config(Config::default()));

        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").expect("rewrite config");
        let reloaded = load_or_create(&path).expect("config should reload");
        assert_eq!(reloaded.logging.level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_load_or_create_reports_invalid_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").expect("write config");

        assert!(load_or_create(&path).is_err());
    }
}
