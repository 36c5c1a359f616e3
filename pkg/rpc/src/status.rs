use common::errors::*;

use crate::metadata::Metadata;

/// Canonical gRPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl Status {
    /// The numeric code used on the wire (matches the canonical gRPC status
    /// codes, e.g. `grpc-status: 5` for NOT_FOUND).
    pub fn code(&self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::Cancelled => 1,
            Status::Unknown => 2,
            Status::InvalidArgument => 3,
            Status::DeadlineExceeded => 4,
            Status::NotFound => 5,
            Status::AlreadyExists => 6,
            Status::PermissionDenied => 7,
            Status::Unauthenticated => 16,
            Status::ResourceExhausted => 8,
            Status::FailedPrecondition => 9,
            Status::Aborted => 10,
            Status::OutOfRange => 11,
            Status::Unimplemented => 12,
            Status::Internal => 13,
            Status::Unavailable => 14,
            Status::DataLoss => 15,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Status::Ok,
            1 => Status::Cancelled,
            2 => Status::Unknown,
            3 => Status::InvalidArgument,
            4 => Status::DeadlineExceeded,
            5 => Status::NotFound,
            6 => Status::AlreadyExists,
            7 => Status::PermissionDenied,
            16 => Status::Unauthenticated,
            8 => Status::ResourceExhausted,
            9 => Status::FailedPrecondition,
            10 => Status::Aborted,
            11 => Status::OutOfRange,
            12 => Status::Unimplemented,
            13 => Status::Internal,
            14 => Status::Unavailable,
            15 => Status::DataLoss,
            _ => return None,
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Raised inside a handler or middleware to terminate a call with a
/// specific, peer-visible status.
///
/// Trailer metadata set on the `CallContext` before this is raised is
/// preserved: the dispatcher only uses `status`/`details` to fill in the
/// trailer's status fields, it never clears what the handler already wrote.
#[error]
#[derive(Clone)]
pub struct ServerError {
    pub status: Status,
    pub details: String,
}

impl ServerError {
    pub fn new<S: Into<String>>(status: Status, details: S) -> Self {
        assert!(!status.is_ok(), "ServerError status must not be OK");
        Self {
            status,
            details: details.into(),
        }
    }
}

/// Raised on the client when the peer's trailer conveys a non-OK status.
#[error]
#[derive(Clone)]
pub struct ClientError {
    pub path: String,
    pub status: Status,
    pub details: String,
    pub trailer: Metadata,
}

/// Raised at the awaiting consumer (client side) or observed via `signal`
/// (server side) when a call is aborted before completion.
#[error]
#[derive(Clone, Copy)]
pub struct AbortError;

/// Thrown by a `Codec` when `encode`/`decode` fails. Mapped to `INTERNAL` on
/// the server and to a local `ClientError(UNKNOWN)` on the client.
#[error]
#[derive(Clone)]
pub struct CodecError {
    pub message: String,
}

impl CodecError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Returns `true` if `err` is (or wraps) an `AbortError` — used by handlers
/// the way `isAbortError` checks are used on the thrown value.
pub fn is_abort_error(err: &Error) -> bool {
    err.downcast_ref::<AbortError>().is_some()
}

/// Returns the `ServerError` carried by `err`, if any.
pub fn as_server_error(err: &Error) -> Option<&ServerError> {
    err.downcast_ref::<ServerError>()
}
