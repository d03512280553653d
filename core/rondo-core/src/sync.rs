//! The backend boundary: request/result types and the `SyncClient` trait.
//!
//! The engine is the only caller. Implementations execute one blocking call
//! per method and never retry mutations internally; the engine decides what
//! is safe to retry.

use rondo_protocol::{Notification, ResponseCode};

use crate::error::EngineError;

pub mod http;

/// How a backend operation failed.
#[derive(Debug, Clone, PartialEq)]
pub enum OpFailure {
    /// Network/transport trouble. Safe to retry the same request.
    Retryable(String),
    /// The backend decoded the request and rejected it. Not retryable as-is.
    Backend(ResponseCode),
}

impl OpFailure {
    pub fn into_engine_error(self) -> EngineError {
        match self {
            OpFailure::Retryable(reason) => EngineError::Transport(reason),
            OpFailure::Backend(code) => EngineError::from_response(code),
        }
    }
}

pub type OpResult<T> = std::result::Result<T, OpFailure>;

/// Request to open a new session (session-insert, SessionStart).
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub channel: String,
    pub latitude: f64,
    pub longitude: f64,
    pub short_device_id: String,
    pub name: String,
    pub address: String,
}

/// Identifiers handed back for a freshly inserted session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: i64,
}

/// Request to join an existing session (invitee-insert, InviteeJoin).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub session_id: i64,
    pub channel: String,
    pub latitude: f64,
    pub longitude: f64,
    pub inviter_short_device_id: String,
    pub name: String,
    pub address: String,
}

/// What the backend returns when a join is accepted: our invitee id plus the
/// inviter's round-up point and name, carried back on the inserted row.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAccepted {
    pub session_id: i64,
    pub invitee_id: i64,
    pub round_up_latitude: f64,
    pub round_up_longitude: f64,
    pub inviter_name: String,
}

/// Invitee-row update shared by location updates, arrival, cancellation and
/// channel-uri refreshes. `data` rides in the row's free payload field.
#[derive(Debug, Clone, PartialEq)]
pub struct InviteeUpdate {
    pub invitee_id: i64,
    pub session_id: i64,
    pub channel: String,
    pub latitude: f64,
    pub longitude: f64,
    pub inviter_short_device_id: String,
    pub name: String,
    pub data: String,
}

/// Session-row update shared by cancel, close, round-up point moves and
/// channel-uri refreshes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub session_id: i64,
    pub short_device_id: String,
    pub channel: String,
    pub latitude: f64,
    pub longitude: f64,
    pub name: String,
    pub address: String,
}

/// An in-session instant message, from either role.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantMessageRequest {
    pub session_id: i64,
    /// `-1` when the sender is the inviter.
    pub invitee_id: i64,
    pub channel: String,
    pub inviter_short_device_id: String,
    pub from_name: String,
    pub text: String,
}

/// RPC façade over the backend table store. One blocking network call per
/// method; implementations must be shareable across worker threads.
pub trait SyncClient: Send + Sync {
    /// Cheap connectivity probe; no table access implied.
    fn network_available(&self) -> bool;

    fn start_session(&self, req: &NewSession) -> OpResult<SessionHandle>;
    fn register_invitee(&self, req: &JoinRequest) -> OpResult<JoinAccepted>;

    fn update_invitee_location(&self, req: &InviteeUpdate) -> OpResult<()>;
    fn mark_arrived(&self, req: &InviteeUpdate) -> OpResult<()>;
    fn cancel_invitee(&self, req: &InviteeUpdate) -> OpResult<()>;
    fn update_invitee_channel_uri(&self, req: &InviteeUpdate) -> OpResult<()>;

    fn cancel_session(&self, req: &SessionUpdate) -> OpResult<()>;
    fn close_session(&self, req: &SessionUpdate) -> OpResult<()>;
    fn move_round_up_point(&self, req: &SessionUpdate) -> OpResult<()>;
    fn update_inviter_channel_uri(&self, req: &SessionUpdate) -> OpResult<()>;

    fn send_instant_message(&self, req: &InstantMessageRequest) -> OpResult<()>;

    /// True when the session row exists with an alive status. A `-1` id is a
    /// local precondition violation and returns `Ok(false)` with no call.
    fn is_session_alive(&self, session_id: i64) -> OpResult<bool>;

    /// The backend-logged notifications for one session, in log order.
    /// Inviter scope: all rows with recipient=inviter. Invitee scope: rows
    /// with recipient=invitee and the given invitee id.
    fn stored_notifications(
        &self,
        session_id: i64,
        invitee_id: i64,
        recipient_is_inviter: bool,
    ) -> OpResult<Vec<Notification>>;
}
