//! Error types for engine operations.
//! Keep the taxonomy closed: the boundary matches on variants, not strings.

use rondo_protocol::ResponseCode;

/// All errors an engine operation can surface to the caller.
///
/// Precondition violations are rejected locally before any network call.
/// Transport failures are safe to retry unchanged; backend rejections are
/// not and carry the decoded response code.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("operation not valid in the current role: {0}")]
    InvalidPrecondition(&'static str),

    #[error("invite code could not be parsed")]
    BadInviteCode,

    #[error("session not found")]
    SessionNotFound,

    #[error("session is no longer alive")]
    SessionNotAlive,

    #[error("inviter key did not match the session")]
    WrongInviterKey,

    #[error("session already has the maximum number of invitees")]
    TooManyInvitees,

    #[error("notification quota exceeded for this device")]
    NotificationLimitExceeded,

    #[error("push channel was not ready in time")]
    ChannelUnavailable,

    #[error("another operation is already in flight")]
    Busy,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("backend rejected the request: {0:?}")]
    Backend(ResponseCode),
}

impl EngineError {
    /// Maps a decoded backend response code onto the caller-facing taxonomy.
    /// Codes with a dedicated variant get one; the rest stay `Backend`.
    pub fn from_response(code: ResponseCode) -> Self {
        match code {
            ResponseCode::SessionNotFound => EngineError::SessionNotFound,
            ResponseCode::SessionDead => EngineError::SessionNotAlive,
            ResponseCode::WrongInviterShortDeviceId => EngineError::WrongInviterKey,
            ResponseCode::TooManyInvitees => EngineError::TooManyInvitees,
            ResponseCode::NotificationLimitExceeded => EngineError::NotificationLimitExceeded,
            other => EngineError::Backend(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_codes_with_dedicated_variants_are_lifted() {
        assert_eq!(
            EngineError::from_response(ResponseCode::TooManyInvitees),
            EngineError::TooManyInvitees
        );
        assert_eq!(
            EngineError::from_response(ResponseCode::SessionDead),
            EngineError::SessionNotAlive
        );
    }

    #[test]
    fn other_backend_codes_stay_wrapped() {
        assert_eq!(
            EngineError::from_response(ResponseCode::InsertFailed),
            EngineError::Backend(ResponseCode::InsertFailed)
        );
        assert_eq!(
            EngineError::from_response(ResponseCode::Unknown("ERR_X".into())),
            EngineError::Backend(ResponseCode::Unknown("ERR_X".into()))
        );
    }
}
