use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} is not valid: {message}")]
    Invalid { name: String, message: String },
}

impl ConfigError {
    pub fn invalid(name: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid { name: name.to_string(), message: message.into() }
    }
}
