//! Input Handling Error Types

use thiserror::Error;

/// Result type for input operations
pub type Result<T> = std::result::Result<T, InputError>;

/// Input module error types
#[derive(Error, Debug)]
pub enum InputError {
    /// XKB keymap could not be compiled from the configured rule names
    #[error("failed to compile XKB keymap for layout '{layout}' variant '{variant}'")]
    KeymapCompile {
        /// Configured layout name
        layout: String,
        /// Configured variant name
        variant: String,
    },

    /// XKB context creation failed
    #[error("failed to create XKB context")]
    ContextCreation,

    /// Keymap serialization produced no output
    #[error("keymap serialization returned an empty string")]
    EmptyKeymap,

    /// Shared memory allocation for the keymap fd failed
    #[error(transparent)]
    Shm(#[from] crate::shm::ShmError),

    /// Writing the serialized keymap failed
    #[error("failed to write keymap into shared memory: {0}")]
    Io(#[from] std::io::Error),
}
