//! IDE engine error types
//!
//! Every failure the engine can hand back to a caller, along with the
//! classification helpers used by the recovery paths.

use core::fmt;

use crate::sense::SenseData;

/// IDE engine error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeError {
    /// Drive not found or not present
    NoDevice,

    /// Invalid parameters passed to function
    InvalidParameter,

    /// A bounded wait exceeded its budget
    Timeout,

    /// ERR or device fault reported with the given status and error registers
    Device { status: u8, error: u8 },

    /// ATAPI command failed with decoded sense data
    Sense(SenseData),

    /// Device entered a phase that does not match the command in flight
    Protocol { status: u8, reason: u8 },

    /// Request cancelled by an administrative rescue
    Aborted,

    /// Resource busy (try again later)
    Busy,

    /// Staging buffer or request allocation failed
    ResourceExhausted,

    /// Write attempted on read-only media
    ReadOnly,

    /// Removable media drive has no medium loaded
    NoMedia,

    /// Operation not supported by this device class
    NotSupported,
}

impl IdeError {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            IdeError::Timeout => true,
            IdeError::Busy => true,
            IdeError::Aborted => true,
            IdeError::Sense(sense) => sense.is_transient(),
            _ => false,
        }
    }

    /// Check if error indicates hardware failure
    pub fn is_hardware_error(&self) -> bool {
        match self {
            IdeError::Device { .. } => true,
            IdeError::Protocol { .. } => true,
            IdeError::Sense(sense) => !sense.is_transient(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            IdeError::Device { .. } => ErrorSeverity::Error,
            IdeError::Protocol { .. } => ErrorSeverity::Error,
            IdeError::Sense(sense) if !sense.is_transient() => ErrorSeverity::Error,
            IdeError::NoDevice => ErrorSeverity::Warning,
            IdeError::Timeout => ErrorSeverity::Warning,
            IdeError::Busy => ErrorSeverity::Info,
            IdeError::NoMedia => ErrorSeverity::Info,
            _ => ErrorSeverity::Warning,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error - driver cannot continue
    Critical,
    /// Serious error - device may be unusable
    Error,
    /// Warning - operation failed but driver can continue
    Warning,
    /// Informational - temporary condition
    Info,
}

impl fmt::Display for IdeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdeError::NoDevice =>
                write!(f, "Drive not found or not present"),
            IdeError::InvalidParameter =>
                write!(f, "Invalid parameters passed to function"),
            IdeError::Timeout =>
                write!(f, "Device did not respond in time"),
            IdeError::Device { status, error } =>
                write!(f, "Device error: status 0x{:02X}, error 0x{:02X}", status, error),
            IdeError::Sense(sense) =>
                write!(f, "ATAPI check condition: {}", sense),
            IdeError::Protocol { status, reason } =>
                write!(f, "Unexpected phase: status 0x{:02X}, interrupt reason 0x{:02X}", status, reason),
            IdeError::Aborted =>
                write!(f, "Request aborted by controller rescue"),
            IdeError::Busy =>
                write!(f, "Resource is busy, try again later"),
            IdeError::ResourceExhausted =>
                write!(f, "Out of memory for transfer buffers"),
            IdeError::ReadOnly =>
                write!(f, "Medium is read-only"),
            IdeError::NoMedia =>
                write!(f, "No medium present"),
            IdeError::NotSupported =>
                write!(f, "Operation not supported by this device"),
        }
    }
}

/// Result type for IDE operations
pub type IdeResult<T> = Result<T, IdeError>;
