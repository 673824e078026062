use thiserror::Error;

use crate::config::ConfigFileError;
use crate::consensus::StepError;
use crate::reactor::deps::{ConnError, RpcError, StoreError, TagError};
use crate::reactor::proto::ProtoDecodeError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error: a thin wrapper over the capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Proto(#[from] ProtoDecodeError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Rpc(err) => match err {
                RpcError::DeadlineExceeded(_) | RpcError::Unreachable(_) => Transience::Retryable,
                RpcError::Remote(_) => Transience::Unknown,
            },
            Error::Store(err) => match err {
                StoreError::DeadlineExceeded(_) => Transience::Retryable,
                StoreError::Io(_) => Transience::Unknown,
            },
            Error::Conn(err) => match err {
                ConnError::NotFound { .. } => Transience::Permanent,
                ConnError::Decrypt(_) => Transience::Permanent,
                ConnError::Write(_) => Transience::Retryable,
            },
            Error::Tag(_) => Transience::Retryable,
            Error::Proto(_) => Transience::Permanent,
            Error::Step(_) => Transience::Permanent,
            Error::ConfigFile(_) => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn deadline_errors_are_retryable() {
        let err: Error = RpcError::DeadlineExceeded(Duration::from_secs(5)).into();
        assert!(err.transience().is_retryable());
        let err: Error = StoreError::DeadlineExceeded(Duration::from_secs(5)).into();
        assert!(err.transience().is_retryable());
    }

    #[test]
    fn stale_terms_are_permanent() {
        let err: Error = StepError::InvalidTerm { term: 1, current: 2 }.into();
        assert_eq!(err.transience(), Transience::Permanent);
    }
}
