//! Error types for the ISOBUS / J1939 protocol engine.
//!
//! A single flat enum is used throughout the crate rather than a per-layer hierarchy, following
//! the reference library's approach of one `Display`/`Error`-implementing enum shared by every
//! module.

use std::error::Error;
use std::fmt;

/// Reason a transport-protocol session was aborted (J1939-21 Table 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Another session was already open on the same (source, destination, PGN) triple.
    AlreadyInOneSession,
    /// No resources available to open the session.
    Resources,
    /// Timeout waiting for CTS, data, or EndOfMessageAck.
    Timeout,
    /// CTS received while the sender was not expecting one.
    UnexpectedCts,
    /// Sequence number out of order during data reassembly.
    BadSequenceNumber,
    /// Total message size does not match what was declared in RTS.
    SizeMismatch,
    /// Receiver ran out of buffer space for the announced size.
    MaxRetransmitExceeded,
    /// Session aborted for a reason not covered by the other variants.
    Other,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::AlreadyInOneSession => "already in one connection-managed session",
            AbortReason::Resources => "insufficient resources",
            AbortReason::Timeout => "timed out",
            AbortReason::UnexpectedCts => "unexpected CTS",
            AbortReason::BadSequenceNumber => "bad sequence number",
            AbortReason::SizeMismatch => "total message size mismatch",
            AbortReason::MaxRetransmitExceeded => "maximum retransmit requests exceeded",
            AbortReason::Other => "other reason",
        };
        write!(f, "{}", s)
    }
}

/// Reason an object pool failed validation (spec §3 invariants i–iv).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolValidationError {
    /// No Working-Set object is present.
    MissingWorkingSet,
    /// More than one Working-Set object is present.
    DuplicateWorkingSet,
    /// The Working-Set does not reference at least one Data-Mask or Alarm-Mask child.
    WorkingSetMissingMask,
    /// A child-id does not resolve to any object in the pool.
    OrphanChild(u16),
    /// Two objects share the same object-id.
    DuplicateObjectId(u16),
    /// A declared body length runs past the remaining serialized buffer.
    TruncatedBody,
}

impl fmt::Display for PoolValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolValidationError::MissingWorkingSet => write!(f, "pool has no Working-Set object"),
            PoolValidationError::DuplicateWorkingSet => {
                write!(f, "pool has more than one Working-Set object")
            }
            PoolValidationError::WorkingSetMissingMask => {
                write!(f, "Working-Set does not reference a Data-Mask or Alarm-Mask")
            }
            PoolValidationError::OrphanChild(id) => write!(f, "child id {} does not exist", id),
            PoolValidationError::DuplicateObjectId(id) => {
                write!(f, "duplicate object id {}", id)
            }
            PoolValidationError::TruncatedBody => {
                write!(f, "object body extends past pool data")
            }
        }
    }
}

/// All errors producible by this crate.
#[derive(Debug)]
pub enum IsobusError {
    /// Malformed input that the caller supplied directly (bad path, bad encoded message).
    InvalidArgument(String),
    /// Operation attempted from a state that does not permit it (send before claim, etc).
    InvalidState(String),
    /// An internal control function lost address-claim contention and is not
    /// arbitrary-address-capable.
    AddressClaimFailed,
    /// A transport-protocol session was aborted.
    TransportAborted(AbortReason),
    /// An object pool failed validation.
    PoolValidation(PoolValidationError),
    /// A file-server operation failed with one of the ISO 11783-13 error codes.
    FsError(crate::fs::error_codes::FSError),
    /// The CAN driver reported a failure sending or receiving a frame.
    BusError(String),
}

impl fmt::Display for IsobusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsobusError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            IsobusError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            IsobusError::AddressClaimFailed => write!(f, "address claim failed"),
            IsobusError::TransportAborted(reason) => {
                write!(f, "transport aborted: {}", reason)
            }
            IsobusError::PoolValidation(detail) => write!(f, "pool validation failed: {}", detail),
            IsobusError::FsError(code) => write!(f, "file server error: {}", code.description()),
            IsobusError::BusError(msg) => write!(f, "bus error: {}", msg),
        }
    }
}

impl Error for IsobusError {}

impl From<crate::fs::error_codes::FSError> for IsobusError {
    fn from(code: crate::fs::error_codes::FSError) -> Self {
        IsobusError::FsError(code)
    }
}

/// A specialized Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, IsobusError>;
