//! Role and snapshot types owned by the session state machine.

use chrono::{DateTime, Utc};
use rondo_protocol::{InviteeStatus, Notification, SessionStatus, UNASSIGNED_ID};
use serde::Serialize;

use crate::geofence::GeoPoint;

/// One live participant as seen by the inviter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub invitee_id: i64,
    pub name: String,
    pub position: GeoPoint,
    pub distance_to_point_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InviterState {
    pub session_id: i64,
    pub status: SessionStatus,
    pub short_device_id: String,
    pub round_up: GeoPoint,
    pub invitees: Vec<RosterEntry>,
    /// True once any invitee has ever joined; an empty roster only ends the
    /// session after that.
    pub any_joined: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InviteeState {
    pub session_id: i64,
    pub invitee_id: i64,
    pub session_status: SessionStatus,
    pub status: InviteeStatus,
    pub inviter_short_device_id: String,
    pub inviter_name: String,
    pub round_up: GeoPoint,
}

/// Exactly one of these holds at a time; entering one clears any residue of
/// the other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Role {
    NoRole,
    Inviter(InviterState),
    Invitee(InviteeState),
}

impl Role {
    pub fn session_id(&self) -> i64 {
        match self {
            Role::NoRole => UNASSIGNED_ID,
            Role::Inviter(state) => state.session_id,
            Role::Invitee(state) => state.session_id,
        }
    }

    pub fn invitee_id(&self) -> i64 {
        match self {
            Role::Invitee(state) => state.invitee_id,
            _ => UNASSIGNED_ID,
        }
    }

    pub fn is_inviter(&self) -> bool {
        matches!(self, Role::Inviter(_))
    }

    pub fn is_invitee(&self) -> bool {
        matches!(self, Role::Invitee(_))
    }

    pub fn has_role(&self) -> bool {
        !matches!(self, Role::NoRole)
    }
}

/// Published on the event bus after every state change; the boundary renders
/// from this rather than subscribing to fine-grained property changes, and
/// persists it to survive process death.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub role: Role,
    /// Notifications observed for the current session, carried so a restored
    /// process can reconcile against the backend log.
    pub retained: Vec<Notification>,
    pub changed_at: DateTime<Utc>,
}
