use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anywhere_storage::DEFAULT_SESSION_NAME;
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::stream::StreamOptions;

pub const SETTINGS_DIRECTORY_NAME: &str = "anywhere";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DEFAULT_CHUNK_IDLE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_FAILURE_NOTICE: &str = "Error: Could not get response from the generation service";

/// Which continuation state a regenerated turn is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryContinuation {
    /// The session's current state, which still remembers the removed exchange.
    #[default]
    Current,
    /// The state the removed reply was generated from.
    Rewind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default)]
    pub default_model: Option<String>,
    /// `0` disables the idle timeout.
    #[serde(default = "default_chunk_idle_timeout_ms")]
    pub chunk_idle_timeout_ms: u64,
    #[serde(default)]
    pub retry_continuation: RetryContinuation,
    #[serde(default = "default_failure_notice")]
    pub failure_notice: String,
    #[serde(default = "default_session_name")]
    pub default_session_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_model: None,
            chunk_idle_timeout_ms: default_chunk_idle_timeout_ms(),
            retry_continuation: RetryContinuation::default(),
            failure_notice: default_failure_notice(),
            default_session_name: default_session_name(),
        }
    }
}

impl EngineSettings {
    pub fn normalized(mut self) -> Self {
        self.default_model = self
            .default_model
            .map(|model| model.trim().to_string())
            .filter(|model| !model.is_empty());
        self.failure_notice = if self.failure_notice.trim().is_empty() {
            default_failure_notice()
        } else {
            self.failure_notice.trim().to_string()
        };
        self.default_session_name = if self.default_session_name.trim().is_empty() {
            default_session_name()
        } else {
            self.default_session_name.trim().to_string()
        };

        self
    }

    pub fn chunk_idle_timeout(&self) -> Option<Duration> {
        (self.chunk_idle_timeout_ms > 0).then(|| Duration::from_millis(self.chunk_idle_timeout_ms))
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            idle_timeout: self.chunk_idle_timeout(),
        }
    }
}

/// Process-wide settings snapshot with optional JSON persistence.
pub struct SettingsStore {
    settings: ArcSwap<EngineSettings>,
    config_path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".anywhere"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path: Some(config_path),
        }
    }

    /// Store that never touches the filesystem.
    pub fn ephemeral(settings: EngineSettings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings.normalized()),
            config_path: None,
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: EngineSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        if let Some(path) = &self.config_path {
            persist(path, &normalized_settings)?;
        }
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> EngineSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
            return EngineSettings::default();
        }

        let figment =
            Figment::from(Serialized::defaults(EngineSettings::default())).merge(Json::file(path));

        match figment.extract::<EngineSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                EngineSettings::default()
            }
        }
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::ephemeral(EngineSettings::default())
    }
}

fn persist(path: &Path, settings: &EngineSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-settings-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
        stage: "serialize-settings-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteFileSnafu {
        stage: "write-temporary-settings-file",
        path: temp_path.clone(),
    })?;

    std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
        stage: "rename-temporary-settings-file",
        from: temp_path,
        to: path.to_path_buf(),
    })?;

    tracing::info!(path = ?path, "saved settings");
    Ok(())
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_chunk_idle_timeout_ms() -> u64 {
    DEFAULT_CHUNK_IDLE_TIMEOUT_MS
}

fn default_failure_notice() -> String {
    DEFAULT_FAILURE_NOTICE.to_string()
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}
