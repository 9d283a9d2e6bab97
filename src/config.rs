//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_OPENAI_API_KEY, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! Secrets (the speech-service API key) come from the environment in
//! practice; the file layer exists for everything else.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub asterisk: AsteriskConfig,
    pub openai: OpenAiConfig,
    pub audio: AudioConfig,
    pub session: SessionTuning,
}

/// HTTP server binding for the operational API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Connection details for the telephony engine's REST/event interface.
///
/// ## Fields:
/// - `base_url`: ARI REST root, e.g. `http://127.0.0.1:8088/ari`
/// - `app_name`: the Stasis application name channels are routed to
/// - `username` / `password`: ARI credentials (HTTP basic + api_key query)
/// - `sounds_dir`: directory Asterisk reads playback media from; transient
///   AI audio files are written here and removed after playback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsteriskConfig {
    pub base_url: String,
    pub app_name: String,
    pub username: String,
    pub password: String,
    pub sounds_dir: String,
}

/// Speech-service connection and conversation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub realtime_url: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub transcription_model: String,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

/// Audio pipeline tuning.
///
/// ## Fields:
/// - `max_pending_chunks`: bound on frames queued while the remote session
///   is not yet ready (overflow drops the newest frame)
/// - `commit_batch_size`: appends accumulated before a commit is scheduled
/// - `commit_debounce_ms`: quiet period before a scheduled commit fires
/// - `commit_ack_timeout_ms`: how long an unacknowledged commit blocks the
///   next one before the guard is cleared
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub max_pending_chunks: usize,
    pub commit_batch_size: usize,
    pub commit_debounce_ms: u64,
    pub commit_ack_timeout_ms: u64,
}

/// Per-call session lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTuning {
    pub session_ready_timeout_ms: u64,
    pub response_fallback_ms: u64,
    pub idle_timeout_secs: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub recording_max_duration_secs: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            asterisk: AsteriskConfig {
                base_url: "http://127.0.0.1:8088/ari".to_string(),
                app_name: "wellness-check".to_string(),
                username: "asterisk".to_string(),
                password: "asterisk".to_string(),
                sounds_dir: "/var/lib/asterisk/sounds/wellness".to_string(),
            },
            openai: OpenAiConfig {
                api_key: String::new(),
                realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview".to_string(),
                voice: "alloy".to_string(),
                instructions: "You are a friendly wellness assistant calling to \
                               check in on a patient. Keep responses short, warm \
                               and spoken-word natural."
                    .to_string(),
                transcription_model: "whisper-1".to_string(),
                vad_threshold: 0.5,
                vad_prefix_padding_ms: 300,
                vad_silence_duration_ms: 500,
            },
            audio: AudioConfig {
                max_pending_chunks: 50,
                commit_batch_size: 10,
                commit_debounce_ms: 200,
                commit_ack_timeout_ms: 5_000,
            },
            session: SessionTuning {
                session_ready_timeout_ms: 10_000,
                response_fallback_ms: 3_000,
                idle_timeout_secs: 300,
                reconnect_base_delay_ms: 1_000,
                reconnect_max_delay_ms: 30_000,
                reconnect_max_attempts: 5,
                recording_max_duration_secs: 3_600,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then config.toml, then APP_* environment
    /// variables, then the HOST/PORT/OPENAI_API_KEY conventions used by
    /// deployment platforms.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("openai.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations that cannot possibly work.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.asterisk.base_url.is_empty() {
            return Err(anyhow::anyhow!("Asterisk base_url must be set"));
        }

        if self.asterisk.app_name.is_empty() {
            return Err(anyhow::anyhow!("Asterisk app_name must be set"));
        }

        if self.audio.max_pending_chunks == 0 {
            return Err(anyhow::anyhow!("max_pending_chunks must be greater than 0"));
        }

        if self.audio.commit_batch_size == 0 {
            return Err(anyhow::anyhow!("commit_batch_size must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.openai.vad_threshold) {
            return Err(anyhow::anyhow!("vad_threshold must be between 0.0 and 1.0"));
        }

        if self.session.reconnect_base_delay_ms > self.session.reconnect_max_delay_ms {
            return Err(anyhow::anyhow!(
                "reconnect_base_delay_ms cannot exceed reconnect_max_delay_ms"
            ));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON document (runtime config endpoint).
    /// Only the fields present in the JSON are touched; the result is
    /// re-validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(openai) = partial_config.get("openai") {
            if let Some(voice) = openai.get("voice").and_then(|v| v.as_str()) {
                self.openai.voice = voice.to_string();
            }
            if let Some(instructions) = openai.get("instructions").and_then(|v| v.as_str()) {
                self.openai.instructions = instructions.to_string();
            }
            if let Some(threshold) = openai.get("vad_threshold").and_then(|v| v.as_f64()) {
                self.openai.vad_threshold = threshold as f32;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(n) = audio.get("max_pending_chunks").and_then(|v| v.as_u64()) {
                self.audio.max_pending_chunks = n as usize;
            }
            if let Some(n) = audio.get("commit_batch_size").and_then(|v| v.as_u64()) {
                self.audio.commit_batch_size = n as usize;
            }
            if let Some(n) = audio.get("commit_debounce_ms").and_then(|v| v.as_u64()) {
                self.audio.commit_debounce_ms = n;
            }
        }

        if let Some(session) = partial_config.get("session") {
            if let Some(n) = session.get("idle_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.idle_timeout_secs = n;
            }
            if let Some(n) = session
                .get("response_fallback_ms")
                .and_then(|v| v.as_u64())
            {
                self.session.response_fallback_ms = n;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.max_pending_chunks, 50);
        assert_eq!(config.audio.commit_batch_size, 10);
        assert_eq!(config.session.reconnect_max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.openai.vad_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.reconnect_base_delay_ms = 60_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "audio": {"commit_batch_size": 20}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.audio.commit_batch_size, 20);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"openai": {"vad_threshold": 2.0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
