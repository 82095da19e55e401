use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: String,
    pub api_prefix: String,
    pub user_id: Option<String>,
    pub input_device: String,
    pub level_smoothing: f32,
    pub speaking_threshold: f32,
    pub playback: bool,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let backend_url = std::env::var("VOZ_BACKEND_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "VOZ_BACKEND_URL".to_string(),
                format!("'{}' must be an http or https URL", backend_url),
            ));
        }

        let api_prefix = std::env::var("VOZ_API_PREFIX").unwrap_or_else(|_| "/api".to_string());

        let user_id = std::env::var("VOZ_USER_ID")
            .ok()
            .filter(|id| !id.trim().is_empty());

        let input_device =
            std::env::var("VOZ_INPUT_DEVICE").unwrap_or_else(|_| "default".to_string());

        let level_smoothing = unit_interval_var("VOZ_LEVEL_SMOOTHING", 0.0)?;
        let speaking_threshold = unit_interval_var("VOZ_SPEAKING_THRESHOLD", 0.02)?;

        let playback = match std::env::var("VOZ_PLAYBACK") {
            Ok(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue(
                        "VOZ_PLAYBACK".to_string(),
                        format!("'{}' is not a boolean", value),
                    ));
                }
            },
            Err(_) => true,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            backend_url,
            api_prefix,
            user_id,
            input_device,
            level_smoothing,
            speaking_threshold,
            playback,
            log_level,
        })
    }
}

fn unit_interval_var(name: &str, default: f32) -> Result<f32, ConfigError> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f32>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            format!("{} is outside [0, 1]", value),
        ));
    }
    Ok(value)
}
