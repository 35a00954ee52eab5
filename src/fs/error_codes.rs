//! ISO 11783-13 file server error codes, open flags, and file attributes.

use bitflags::bitflags;

/// Standard file server error codes (ISO 11783-13 Table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FSError {
    Success = 0,
    AccessDenied = 1,
    InvalidAccess = 2,
    TooManyOpen = 3,
    NotFound = 4,
    WrongType = 5,
    MaxHandles = 6,
    InvalidHandle = 7,
    InvalidSourceName = 8,
    InvalidDestName = 9,
    NoSpace = 10,
    WriteFail = 11,
    MediaNotPresent = 12,
    NotInitialized = 13,
    NotSupported = 20,
    InvalidLength = 42,
    OutOfMemory = 43,
    OtherError = 44,
    Eof = 45,
    TanError = 46,
    MalformedRequest = 47,
}

impl FSError {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => FSError::Success,
            1 => FSError::AccessDenied,
            2 => FSError::InvalidAccess,
            3 => FSError::TooManyOpen,
            4 => FSError::NotFound,
            5 => FSError::WrongType,
            6 => FSError::MaxHandles,
            7 => FSError::InvalidHandle,
            8 => FSError::InvalidSourceName,
            9 => FSError::InvalidDestName,
            10 => FSError::NoSpace,
            11 => FSError::WriteFail,
            12 => FSError::MediaNotPresent,
            13 => FSError::NotInitialized,
            20 => FSError::NotSupported,
            42 => FSError::InvalidLength,
            43 => FSError::OutOfMemory,
            45 => FSError::Eof,
            46 => FSError::TanError,
            47 => FSError::MalformedRequest,
            _ => FSError::OtherError,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            FSError::Success => "operation completed successfully",
            FSError::AccessDenied => "file access denied due to insufficient permissions",
            FSError::InvalidAccess => "invalid access mode requested",
            FSError::TooManyOpen => "too many files already open by this client",
            FSError::NotFound => "file or directory not found at specified path",
            FSError::WrongType => "wrong type, expected file but found directory or vice versa",
            FSError::MaxHandles => "maximum number of file handles reached server-wide",
            FSError::InvalidHandle => "invalid file handle specified in request",
            FSError::InvalidSourceName => "invalid source filename",
            FSError::InvalidDestName => "invalid destination filename",
            FSError::NoSpace => "insufficient space on volume for operation",
            FSError::WriteFail => "write operation failed",
            FSError::MediaNotPresent => "removable media not present in drive",
            FSError::NotInitialized => "file system not initialized or mount failed",
            FSError::NotSupported => "operation not supported by this file server",
            FSError::InvalidLength => "invalid data length in request",
            FSError::OutOfMemory => "insufficient memory to complete operation",
            FSError::OtherError => "other unspecified error occurred",
            FSError::Eof => "end of file reached during read operation",
            FSError::TanError => "transaction number mismatch or error",
            FSError::MalformedRequest => "request message is malformed or invalid",
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, FSError::OutOfMemory | FSError::NotInitialized | FSError::MediaNotPresent)
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, FSError::TooManyOpen | FSError::MaxHandles | FSError::WriteFail)
    }
}

impl std::fmt::Display for FSError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl std::error::Error for FSError {}

bitflags! {
    /// File open mode and flags (ISO 11783-13).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const READ = 0x00;
        const WRITE = 0x01;
        const READ_WRITE = 0x02;
        const OPEN_DIR = 0x03;
        const CREATE = 0x04;
        const APPEND = 0x08;
        const EXCLUSIVE = 0x10;
    }
}

impl OpenFlags {
    /// The access-mode sub-bits (bits 0-1).
    pub fn access_mode(self) -> OpenFlags {
        self & OpenFlags::OPEN_DIR
    }
}

bitflags! {
    /// File attribute bits (ISO 11783-13).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const VOLUME = 0x40;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_code() {
        for error in [
            FSError::Success,
            FSError::NotFound,
            FSError::MaxHandles,
            FSError::TanError,
            FSError::MalformedRequest,
        ] {
            assert_eq!(FSError::from_code(error.code()), error);
        }
    }

    #[test]
    fn fatal_and_retryable_are_disjoint_categories() {
        assert!(FSError::OutOfMemory.is_fatal());
        assert!(!FSError::OutOfMemory.is_retryable());
        assert!(FSError::WriteFail.is_retryable());
        assert!(!FSError::WriteFail.is_fatal());
    }

    #[test]
    fn open_flags_access_mode_masks_low_bits() {
        let flags = OpenFlags::READ_WRITE | OpenFlags::CREATE;
        assert_eq!(flags.access_mode(), OpenFlags::READ_WRITE);
    }
}
