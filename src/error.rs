//! Error types for levelflow.

use crate::level::LevelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LevelflowError {
    // Level errors
    #[error("Level error: {0}")]
    Level(#[from] LevelError),

    #[error("Level '{level}': {source}")]
    LevelSetup {
        level: String,
        #[source]
        source: LevelError,
    },

    // Pipeline construction errors
    #[error("Level '{level}' already has writer '{writer}', '{component}' cannot write it too")]
    DuplicateWriter {
        level: String,
        writer: String,
        component: String,
    },

    #[error("Level '{level}' is read by {readers:?} but nothing writes it")]
    MissingWriter { level: String, readers: Vec<String> },

    #[error("Unknown component: {name}")]
    UnknownComponent { name: String },

    #[error("Component '{name}' is already part of the pipeline")]
    DuplicateComponent { name: String },

    #[error("Configuration stalled: {pending:?} never finished configuring")]
    ConfigureStalled { pending: Vec<String> },

    // Runtime errors
    #[error("Component '{component}' failed: {message}")]
    ComponentFailed { component: String, message: String },

    #[error("Component '{component}' panicked: {message}")]
    ComponentPanicked { component: String, message: String },

    // Input errors
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Unsupported input: {message}")]
    UnsupportedInput { message: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, LevelflowError>;
