#![forbid(unsafe_code)]

// Error taxonomy for room, queue, and upload operations

use thiserror::Error;

/// Domain errors. All of these are recovered locally and echoed back to the
/// originating session only — they never take down the event loop.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Insufficient permissions for {0}")]
    Unauthorized(&'static str),

    #[error("Display name already in use: {0}")]
    NameTaken(String),

    #[error("You are banned from this room")]
    Banned,

    #[error("The room is locked — speaking requests are closed")]
    RoomLocked,

    #[error("Not the current speaker")]
    NotSpeaking,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
}

/// Result type alias for room operations
pub type ChatResult<T> = Result<T, ChatError>;
