//! Configuration management for the realtime voice engine

pub mod file;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::{Error, Result};

use file::VoiceConfigFile;

/// Default realtime WebSocket endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

/// Default realtime model
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Default assistant instructions
const DEFAULT_INSTRUCTIONS: &str =
    "You are a friendly voice assistant. Keep answers short and conversational.";

/// Engine configuration
#[derive(Debug)]
pub struct Config {
    /// WebSocket endpoint of the realtime service
    pub endpoint: String,

    /// Realtime model identifier, passed as the `model` query parameter
    pub model: String,

    /// API key (from `OPENAI_API_KEY` or the config file)
    pub api_key: Option<SecretString>,

    /// Per-session settings sent in `session.update`
    pub session: SessionConfig,

    /// Local audio settings
    pub audio: AudioConfig,
}

/// Settings sent to the service when a session opens
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Voice identity for synthesized speech
    pub voice: String,

    /// System instructions
    pub instructions: String,

    /// Model used to transcribe the user's audio
    pub transcription_model: String,

    /// Server VAD parameters
    pub turn_detection: TurnDetection,
}

/// Server-side voice activity detection parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnDetection {
    /// Activation threshold (0.0 to 1.0)
    pub threshold: f32,

    /// Audio included before detected speech start
    pub prefix_padding_ms: u32,

    /// Silence required to end a turn
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetection::default(),
        }
    }
}

/// Local audio settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConfig {
    /// Gain applied to inbound speech before clamping
    pub output_gain: f32,

    /// Duration of each outbound audio frame
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_gain: 1.5,
            frame_ms: 40,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            session: SessionConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    #[must_use]
    pub fn load() -> Self {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// Environment values win over file values, which win over defaults.
    /// Unparseable numeric env values fall through to the next layer.
    pub fn from_sources<F>(fc: VoiceConfigFile, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_key = env("OPENAI_API_KEY")
            .or(fc.service.api_key)
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        let turn_detection = TurnDetection {
            threshold: parse_env(&env, "VOICE_VAD_THRESHOLD")
                .or(fc.turn_detection.threshold)
                .unwrap_or(defaults.session.turn_detection.threshold),
            prefix_padding_ms: parse_env(&env, "VOICE_PREFIX_PADDING_MS")
                .or(fc.turn_detection.prefix_padding_ms)
                .unwrap_or(defaults.session.turn_detection.prefix_padding_ms),
            silence_duration_ms: parse_env(&env, "VOICE_SILENCE_DURATION_MS")
                .or(fc.turn_detection.silence_duration_ms)
                .unwrap_or(defaults.session.turn_detection.silence_duration_ms),
        };

        let session = SessionConfig {
            voice: env("VOICE_NAME")
                .or(fc.session.voice)
                .unwrap_or(defaults.session.voice),
            instructions: env("VOICE_INSTRUCTIONS")
                .or(fc.session.instructions)
                .unwrap_or(defaults.session.instructions),
            transcription_model: env("VOICE_TRANSCRIPTION_MODEL")
                .or(fc.session.transcription_model)
                .unwrap_or(defaults.session.transcription_model),
            turn_detection,
        };

        let audio = AudioConfig {
            output_gain: parse_env(&env, "VOICE_OUTPUT_GAIN")
                .or(fc.audio.output_gain)
                .unwrap_or(defaults.audio.output_gain),
            frame_ms: parse_env(&env, "VOICE_FRAME_MS")
                .or(fc.audio.frame_ms)
                .unwrap_or(defaults.audio.frame_ms),
        };

        Self {
            endpoint: env("VOICE_ENDPOINT")
                .or(fc.service.endpoint)
                .unwrap_or(defaults.endpoint),
            model: env("VOICE_MODEL")
                .or(fc.service.model)
                .unwrap_or(defaults.model),
            api_key,
            session,
            audio,
        }
    }

    /// Check that a session could be opened with this configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is missing, the endpoint is not
    /// a `ws`/`wss` URL, or audio settings are out of range
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(Error::Config(
                "API key required (set OPENAI_API_KEY)".to_string(),
            ));
        }

        self.realtime_url()?;

        if !self.audio.output_gain.is_finite() || self.audio.output_gain <= 0.0 {
            return Err(Error::Config(format!(
                "output gain must be positive, got {}",
                self.audio.output_gain
            )));
        }

        if !(10..=1000).contains(&self.audio.frame_ms) {
            return Err(Error::Config(format!(
                "frame duration must be 10-1000 ms, got {}",
                self.audio.frame_ms
            )));
        }

        let threshold = self.session.turn_detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Config(format!(
                "VAD threshold must be within 0.0-1.0, got {threshold}"
            )));
        }

        Ok(())
    }

    /// Endpoint URL with the model query parameter applied
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the endpoint does not parse or uses a
    /// scheme other than `ws`/`wss`
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {}: {e}", self.endpoint)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "endpoint must use ws or wss, got {}",
                url.scheme()
            )));
        }

        let has_model = url.query_pairs().any(|(k, _)| k == "model");
        if !has_model {
            url.query_pairs_mut().append_pair("model", &self.model);
        }

        Ok(url)
    }

    /// Bearer token for the realtime service
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if no API key is configured
    pub fn bearer_token(&self) -> Result<String> {
        self.api_key
            .as_ref()
            .map(|k| format!("Bearer {}", k.expose_secret()))
            .ok_or_else(|| Error::Config("API key required (set OPENAI_API_KEY)".to_string()))
    }
}

/// Parse a numeric env value, treating garbage as absent
fn parse_env<T, F>(env: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    env(key).and_then(|v| v.trim().parse().ok())
}
