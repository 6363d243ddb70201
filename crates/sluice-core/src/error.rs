//! Error types and wire-level error codes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` for sluice-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core facilities (configuration loading, parsing).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Wire-level error codes surfaced by the membership protocol.
///
/// The discriminants are stable; they travel as `int32` inside RPC replies
/// and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Errc {
    /// Operation succeeded.
    Success = 0,
    /// Malformed or inconsistent request.
    InvalidRequest = 1,
    /// The requested node operation is not permitted in the current state.
    InvalidNodeOperation = 2,
    /// A node configuration update failed validation.
    InvalidConfigurationUpdate = 3,
    /// No controller leader is currently known.
    NoLeaderController = 4,
    /// Every configured seed server was tried without success.
    SeedServersExhausted = 5,
    /// Forwarding a join request to the leader failed.
    JoinRequestDispatchError = 6,
}

impl Errc {
    /// Returns true for [`Errc::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Decodes a wire integer, mapping unknown values to
    /// [`Errc::InvalidRequest`].
    #[must_use]
    pub const fn from_wire(code: i32) -> Self {
        match code {
            0 => Self::Success,
            2 => Self::InvalidNodeOperation,
            3 => Self::InvalidConfigurationUpdate,
            4 => Self::NoLeaderController,
            5 => Self::SeedServersExhausted,
            6 => Self::JoinRequestDispatchError,
            _ => Self::InvalidRequest,
        }
    }

    /// Converts a code into a `Result`, with `Success` becoming `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the code itself for anything other than `Success`.
    pub const fn into_result(self) -> std::result::Result<(), Errc> {
        match self {
            Self::Success => Ok(()),
            other => Err(other),
        }
    }
}

impl From<Errc> for i32 {
    fn from(e: Errc) -> i32 {
        e as i32
    }
}

impl fmt::Display for Errc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::InvalidRequest => "invalid request",
            Self::InvalidNodeOperation => "invalid node operation",
            Self::InvalidConfigurationUpdate => "invalid configuration update",
            Self::NoLeaderController => "no leader controller",
            Self::SeedServersExhausted => "seed servers exhausted",
            Self::JoinRequestDispatchError => "join request dispatch error",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Errc {}
