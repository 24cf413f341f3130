//! TOML configuration file loading
//!
//! Supports `~/.config/omni/voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Realtime service connection settings
    #[serde(default)]
    pub service: ServiceFileConfig,

    /// Session settings sent in `session.update`
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Server-side turn detection
    #[serde(default)]
    pub turn_detection: TurnDetectionFileConfig,

    /// Local audio settings
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Realtime service connection settings
#[derive(Debug, Default, Deserialize)]
pub struct ServiceFileConfig {
    /// WebSocket endpoint (e.g. "wss://api.openai.com/v1/realtime")
    pub endpoint: Option<String>,

    /// Realtime model identifier
    pub model: Option<String>,

    /// API key; prefer the `OPENAI_API_KEY` env var
    pub api_key: Option<String>,
}

/// Session settings
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Voice identity (e.g. "alloy")
    pub voice: Option<String>,

    /// System instructions for the assistant
    pub instructions: Option<String>,

    /// Model used for input audio transcription
    pub transcription_model: Option<String>,
}

/// Server VAD parameters
#[derive(Debug, Default, Deserialize)]
pub struct TurnDetectionFileConfig {
    pub threshold: Option<f32>,
    pub prefix_padding_ms: Option<u32>,
    pub silence_duration_ms: Option<u32>,
}

/// Local audio settings
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Gain applied to inbound speech before playback
    pub output_gain: Option<f32>,

    /// Outbound frame duration in milliseconds
    pub frame_ms: Option<u32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> crate::Result<VoiceConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/omni/voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("voice")
            .join("config.toml")
    })
}
