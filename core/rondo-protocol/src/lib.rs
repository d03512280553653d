//! Wire and persistence schema for the rondo session engine.
//!
//! This crate is shared by the engine and anything that talks to the backend
//! table store, to prevent schema drift. Field names follow the backend
//! contract exactly; the backend remains the authority on validation, but
//! clients reuse the same types to construct valid requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod flat;
pub mod invite;

/// Row id value meaning "not assigned by the backend yet".
pub const UNASSIGNED_ID: i64 = -1;

/// Length of the inviter's short device id, embedded in invite codes.
pub const SHORT_DEVICE_ID_LEN: usize = 8;

/// Hard cap on live invitees per session (server-enforced, mirrored here).
pub const MAX_INVITEES: usize = 10;

/// Lifecycle states of a session, as stored in the backend session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    NotSet = 0,
    SessionStarted = 1,
    SessionActive = 2,
    SessionCancelledByInviter = 3,
    SessionCancelledByInvitees = 4,
    SessionHasEnded = 5,
    SessionAborted = 6,
    SessionDead = 7,
}

impl SessionStatus {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => SessionStatus::SessionStarted,
            2 => SessionStatus::SessionActive,
            3 => SessionStatus::SessionCancelledByInviter,
            4 => SessionStatus::SessionCancelledByInvitees,
            5 => SessionStatus::SessionHasEnded,
            6 => SessionStatus::SessionAborted,
            7 => SessionStatus::SessionDead,
            _ => SessionStatus::NotSet,
        }
    }

    /// Alive means the session can still accept invitees and broadcasts.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            SessionStatus::SessionStarted | SessionStatus::SessionActive
        )
    }
}

/// Lifecycle states of an invitee, as stored in the backend invitee table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteeStatus {
    NotSet = 0,
    InviteeHasNotResponded = 1,
    InviteeHasAccepted = 2,
    InviteeHasDeclined = 3,
    InviteeHasCancelled = 4,
    InviteeHasArrived = 5,
    /// Transient; set whenever a location-update request is sent.
    InviteeIsEnRoute = 6,
}

impl InviteeStatus {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => InviteeStatus::InviteeHasNotResponded,
            2 => InviteeStatus::InviteeHasAccepted,
            3 => InviteeStatus::InviteeHasDeclined,
            4 => InviteeStatus::InviteeHasCancelled,
            5 => InviteeStatus::InviteeHasArrived,
            6 => InviteeStatus::InviteeIsEnRoute,
            _ => InviteeStatus::NotSet,
        }
    }
}

/// Intended recipient of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Inviter = 0,
    Invitee = 1,
    Unknown = -1,
}

impl Recipient {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Recipient::Inviter,
            1 => Recipient::Invitee,
            _ => Recipient::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Semantic type of a delivered notification. Carried as a string token in
/// the push payload and the backend notification log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageId {
    InvalidMessage,
    SessionStarted,
    SessionCancelledByInviter,
    SessionHasEnded,
    SessionAborted,
    InviteeHasAccepted,
    InviteeHasCancelled,
    InviteeHasArrived,
    InviteeLocationUpdate,
    RoundUpLocationChange,
    InstantMessage,
    SessionDead,
}

impl MessageId {
    /// Total mapping from a wire token. Unknown tokens become
    /// `InvalidMessage` so a newer backend never crashes an older client.
    pub fn parse(token: &str) -> Self {
        match token {
            "SessionStarted" => MessageId::SessionStarted,
            "SessionCancelledByInviter" => MessageId::SessionCancelledByInviter,
            "SessionHasEnded" => MessageId::SessionHasEnded,
            "SessionAborted" => MessageId::SessionAborted,
            "InviteeHasAccepted" => MessageId::InviteeHasAccepted,
            "InviteeHasCancelled" => MessageId::InviteeHasCancelled,
            "InviteeHasArrived" => MessageId::InviteeHasArrived,
            "InviteeLocationUpdate" => MessageId::InviteeLocationUpdate,
            "RoundUpLocationChange" => MessageId::RoundUpLocationChange,
            "InstantMessage" => MessageId::InstantMessage,
            "SessionDead" => MessageId::SessionDead,
            _ => MessageId::InvalidMessage,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageId::InvalidMessage => "InvalidMessage",
            MessageId::SessionStarted => "SessionStarted",
            MessageId::SessionCancelledByInviter => "SessionCancelledByInviter",
            MessageId::SessionHasEnded => "SessionHasEnded",
            MessageId::SessionAborted => "SessionAborted",
            MessageId::InviteeHasAccepted => "InviteeHasAccepted",
            MessageId::InviteeHasCancelled => "InviteeHasCancelled",
            MessageId::InviteeHasArrived => "InviteeHasArrived",
            MessageId::InviteeLocationUpdate => "InviteeLocationUpdate",
            MessageId::RoundUpLocationChange => "RoundUpLocationChange",
            MessageId::InstantMessage => "InstantMessage",
            MessageId::SessionDead => "SessionDead",
        }
    }

    /// Messages that end the session for every participant. A reconciliation
    /// pass that sees one of these delivers it alone and stops.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageId::SessionCancelledByInviter
                | MessageId::SessionHasEnded
                | MessageId::SessionDead
        )
    }
}

/// Integer tag on an outbound request selecting server-side handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMessageId {
    InvalidMessage = 0,
    SessionStart = 1,
    SessionCancel = 2,
    InviteeJoin = 3,
    InviteeCancel = 4,
    InviteeLocationUpdate = 5,
    RoundUpLocationChange = 6,
    InstantMessage = 7,
    InviteeHasArrived = 8,
    SessionHasEnded = 9,
    UpdateInviterChannelUri = 10,
    UpdateInviteeChannelUri = 11,
}

impl RequestMessageId {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Custom response tokens returned by the backend request scripts. The
/// mapping from wire token to this enum is total: anything unrecognized
/// lands in `Unknown` with the original token preserved for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    ChannelUriNull,
    InvalidRequestMessageId,
    SessionNotFound,
    SessionDead,
    WrongInviterShortDeviceId,
    NotificationLimitExceeded,
    InsertFailed,
    UpdateFailed,
    ReadFailed,
    TooManyInvitees,
    Unknown(String),
}

impl ResponseCode {
    pub fn parse_token(token: &str) -> Self {
        match token {
            "SUCCESS" => ResponseCode::Success,
            "ERR_CHANNEL_URI_NULL" => ResponseCode::ChannelUriNull,
            "ERR_INVALID_REQUEST_MESSAGE_ID" => ResponseCode::InvalidRequestMessageId,
            "ERR_SESSION_NOT_FOUND" => ResponseCode::SessionNotFound,
            "ERR_SESSION_DEAD" => ResponseCode::SessionDead,
            "ERR_WRONG_INVITER_SHORT_DEVICE_ID" => ResponseCode::WrongInviterShortDeviceId,
            "ERR_NOTIFICATION_LIMIT_EXCEEDED" => ResponseCode::NotificationLimitExceeded,
            "ERR_INSERT_FAILED" => ResponseCode::InsertFailed,
            "ERR_UPDATE_FAILED" => ResponseCode::UpdateFailed,
            "ERR_READ_FAILED" => ResponseCode::ReadFailed,
            "ERR_TOO_MANY_INVITEES" => ResponseCode::TooManyInvitees,
            other => ResponseCode::Unknown(other.to_string()),
        }
    }
}

/// One meet-up session row in the backend session table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "unassigned")]
    pub id: i64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Device")]
    pub device: i32,
    #[serde(rename = "ShortDeviceId")]
    pub short_device_id: String,
    #[serde(rename = "RequestMessageId")]
    pub request_message_id: i32,
    #[serde(rename = "SessionStatusId")]
    pub session_status_id: i32,
    #[serde(rename = "RequestDataId")]
    pub request_data_id: i64,
    #[serde(rename = "RequestData")]
    pub request_data: String,
}

/// One participant row in the backend invitee table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitee {
    #[serde(default = "unassigned")]
    pub id: i64,
    /// Session (row) id this invitee belongs to.
    pub sid: i64,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "Latitude")]
    pub latitude: f64,
    #[serde(rename = "Longitude")]
    pub longitude: f64,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Device")]
    pub device: i32,
    #[serde(rename = "RequestMessageId")]
    pub request_message_id: i32,
    #[serde(rename = "InviteeStatusId")]
    pub invitee_status_id: i32,
    #[serde(rename = "InviterShortDeviceId")]
    pub inviter_short_device_id: String,
    #[serde(rename = "RequestDataId")]
    pub request_data_id: i64,
    #[serde(rename = "RequestData")]
    pub request_data: String,
}

/// An immutable record of one server-requested push. The backend logs a copy
/// of every notification it asks the push service to deliver; the client
/// mirrors recent ones in a transient in-memory list for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "unassigned")]
    pub id: i64,
    #[serde(rename = "Recipient")]
    pub recipient: i32,
    #[serde(rename = "SessionId")]
    pub session_id: i64,
    #[serde(rename = "InviteeId")]
    pub invitee_id: i64,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "Data", default)]
    pub data: String,
    #[serde(rename = "ShortDeviceId", default)]
    pub short_device_id: String,
    #[serde(rename = "Latitude", default)]
    pub latitude: f64,
    #[serde(rename = "Longitude", default)]
    pub longitude: f64,
}

impl Notification {
    /// Semantic type of this notification (total; unknown tokens map to
    /// `InvalidMessage`).
    pub fn message(&self) -> MessageId {
        MessageId::parse(&self.message_id)
    }

    /// True when the notification is scoped to the session as a whole rather
    /// than to one invitee.
    pub fn is_session_scoped(&self) -> bool {
        self.invitee_id == UNASSIGNED_ID
    }
}

/// Parses a push payload delivered over the push channel.
pub fn parse_push_payload(json: &str) -> Result<Notification, serde_json::Error> {
    serde_json::from_str(json)
}

fn unassigned() -> i64 {
    UNASSIGNED_ID
}
