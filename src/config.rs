use secrecy::{ExposeSecret, SecretBox};
use std::env;
use thiserror::Error;

/// Sample rate of microphone audio sent to the model.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of model audio received from the channel.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame.
pub const FRAME_SAMPLES: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid API key: {0}")]
    InvalidKey(String),
}

/// Configuration for the live session: credential plus the model, voice and
/// instruction sent in the channel setup message.
#[derive(Debug)]
pub struct LiveConfig {
    api_key: SecretBox<String>,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

impl LiveConfig {
    /// Load configuration from the environment (`GEMINI_API_KEY`), with `.env`
    /// support for development.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Don't error if .env doesn't exist

        let key = env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()))?;

        Self::with_key(key)
    }

    /// Build a configuration around an explicit key, using the default model,
    /// voice and system instruction.
    pub fn with_key(key: String) -> Result<Self, ConfigError> {
        Self::validate_key(&key)?;

        Ok(Self {
            api_key: SecretBox::new(Box::new(key)),
            model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "Você é um assistente virtual prestativo e amigável. \
                Fale português do Brasil de forma natural e concisa."
                .to_string(),
        })
    }

    fn validate_key(key: &str) -> Result<(), ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKey(
                "API key cannot be empty".to_string(),
            ));
        }
        if !key.starts_with("AIza") {
            // Keys issued for this API carry the AIza prefix; anything else is
            // probably a copy-paste mistake, but let the server decide.
            log::warn!("API key does not look like a Google AI key (AIza...)");
        }
        Ok(())
    }

    /// Get the API key (use only when opening the channel).
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }
}

/// Load configuration with helpful error messages for development.
pub fn load_config() -> Result<LiveConfig, ConfigError> {
    match LiveConfig::load() {
        Ok(config) => {
            log::info!(
                "Loaded live session configuration (model: {})",
                config.model
            );
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
