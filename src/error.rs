use thiserror::Error;

use crate::idset::IdSet;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("job {0} not found")]
    JobNotFound(u64),

    #[error("job {0} already exists")]
    JobExists(u64),

    #[error("rank {0} is not a child of this rank")]
    UnknownPeer(u32),

    #[error("ranks {0} are not reachable from this rank")]
    UnreachableRanks(IdSet),

    #[error("handler already registered for type \"{0}\"")]
    DuplicateHandler(String),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("barrier sequence mismatch: got {got}, expected {expected}")]
    BarrierMismatch { got: u64, expected: u64 },

    #[error("{0} already in progress")]
    Busy(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Protocol(_) => tonic::Status::invalid_argument(message),
            Error::JobNotFound(_) | Error::UnknownPeer(_) | Error::UnreachableRanks(_) => {
                tonic::Status::not_found(message)
            }
            Error::JobExists(_) | Error::DuplicateHandler(_) => {
                tonic::Status::already_exists(message)
            }
            Error::Unsupported(_) => tonic::Status::unimplemented(message),
            Error::BarrierMismatch { .. } => tonic::Status::failed_precondition(message),
            Error::Busy(_) | Error::Transport(_) | Error::Unavailable => {
                tonic::Status::unavailable(message)
            }
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Transport(status.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that job errors map to the expected gRPC status codes.
    #[test]
    fn test_status_mapping() {
        let status = tonic::Status::from(Error::JobNotFound(42));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("42"));

        let status = tonic::Status::from(Error::JobExists(7));
        assert_eq!(status.code(), tonic::Code::AlreadyExists);

        let status = tonic::Status::from(Error::Protocol("bad idset".to_string()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = tonic::Status::from(Error::BarrierMismatch { got: 1, expected: 0 });
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    /// Test that a gRPC status converts back to a transport error carrying
    /// the original message.
    #[test]
    fn test_status_roundtrip_message() {
        let status = tonic::Status::unavailable("parent is gone");
        let err = Error::from(status);
        assert!(matches!(err, Error::Transport(ref msg) if msg == "parent is gone"));
    }
}
