//! Error types for Sonal

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SonalError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid enum: {0}")]
    InvalidEnum(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, SonalError>;

/// Error codes as reported through [`SonalContext::get_error`](crate::SonalContext::get_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    NoError,
    InvalidName,
    InvalidEnum,
    InvalidValue,
    InvalidOperation,
    OutOfMemory,
}

impl SonalError {
    /// Maps the error onto the code latched by the owning context.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::InvalidEnum(_) => ErrorCode::InvalidEnum,
            Self::InvalidValue(_) | Self::AudioFormat(_) | Self::Configuration(_) => {
                ErrorCode::InvalidValue
            }
            Self::InvalidOperation(_) | Self::Backend(_) | Self::AudioDevice(_) => {
                ErrorCode::InvalidOperation
            }
            Self::OutOfMemory(_) => ErrorCode::OutOfMemory,
        }
    }
}

/// Error register holding the first unacknowledged error.
///
/// Later errors never overwrite an earlier one until [`ErrorLatch::take`]
/// clears the register.
#[derive(Debug, Default)]
pub struct ErrorLatch {
    code: ErrorCode,
}

impl ErrorLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latch(&mut self, code: ErrorCode) {
        if self.code == ErrorCode::NoError {
            self.code = code;
        }
    }

    /// Returns the latched code and resets the register.
    pub fn take(&mut self) -> ErrorCode {
        std::mem::take(&mut self.code)
    }

    pub fn peek(&self) -> ErrorCode {
        self.code
    }
}
