//! Maps inbound notifications to role transitions.
//! Conservative rules: a message for the wrong role, an unknown invitee, or
//! an unknown token is ignored rather than guessed at, which is also what
//! makes replay idempotent.

use rondo_protocol::{MessageId, Notification, SessionStatus, MAX_INVITEES};
use tracing::{debug, warn};

use super::types::{Role, RosterEntry};
use crate::geofence::{distance_meters, GeoPoint};

/// What applying one notification did to the role.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// No state change (wrong role, duplicate, unknown token...).
    Ignored,
    /// Inviter: a new invitee joined; session is now active.
    InviteeJoined { invitee_id: i64, name: String },
    /// Inviter: a roster entry moved.
    InviteeMoved { invitee_id: i64 },
    /// Inviter: an invitee left the roster.
    InviteeLeft {
        invitee_id: i64,
        arrived: bool,
        /// True when the roster emptied after at least one join; the caller
        /// should close the session.
        roster_empty: bool,
    },
    /// Invitee: the round-up point moved.
    RoundUpMoved { point: GeoPoint },
    /// An in-session instant message for the boundary to display.
    Message { invitee_id: i64, text: String },
    /// The session is over; the role has been reset to `NoRole`.
    Terminated { reason: MessageId },
}

pub fn apply_notification(role: &mut Role, notification: &Notification) -> Applied {
    let message = notification.message();
    match message {
        MessageId::SessionCancelledByInviter => {
            // Only ever broadcast to invitees.
            if role.is_invitee() {
                *role = Role::NoRole;
                Applied::Terminated { reason: message }
            } else {
                Applied::Ignored
            }
        }

        MessageId::SessionHasEnded | MessageId::SessionDead => {
            if role.has_role() {
                *role = Role::NoRole;
                Applied::Terminated { reason: message }
            } else {
                Applied::Ignored
            }
        }

        MessageId::InviteeHasAccepted => apply_invitee_joined(role, notification),
        MessageId::InviteeLocationUpdate => apply_invitee_moved(role, notification),
        MessageId::InviteeHasCancelled => apply_invitee_left(role, notification, false),
        MessageId::InviteeHasArrived => apply_invitee_left(role, notification, true),

        MessageId::RoundUpLocationChange => {
            // Inviters set the point locally when they move it.
            match role {
                Role::Invitee(state) => {
                    let point =
                        GeoPoint::new(notification.latitude, notification.longitude);
                    state.round_up = point;
                    Applied::RoundUpMoved { point }
                }
                _ => Applied::Ignored,
            }
        }

        MessageId::InstantMessage => {
            if role.has_role() {
                Applied::Message {
                    invitee_id: notification.invitee_id,
                    text: notification.data.clone(),
                }
            } else {
                Applied::Ignored
            }
        }

        // SessionStarted is handled inline when the start operation
        // completes; SessionAborted is recognized but never emitted to
        // clients. Both fall through with the unknown tokens.
        MessageId::SessionStarted
        | MessageId::SessionAborted
        | MessageId::InvalidMessage => {
            debug!(message = %notification.message_id, "notification ignored");
            Applied::Ignored
        }
    }
}

fn apply_invitee_joined(role: &mut Role, notification: &Notification) -> Applied {
    let Role::Inviter(state) = role else {
        return Applied::Ignored;
    };

    // Duplicate delivery of the same join is a no-op.
    if state
        .invitees
        .iter()
        .any(|entry| entry.invitee_id == notification.invitee_id)
    {
        return Applied::Ignored;
    }

    // The backend caps live invitees; a join past the cap should never
    // reach us.
    if state.invitees.len() >= MAX_INVITEES {
        warn!(
            invitee_id = notification.invitee_id,
            "join notification past the invitee cap; ignored"
        );
        return Applied::Ignored;
    }

    let position = GeoPoint::new(notification.latitude, notification.longitude);
    state.invitees.push(RosterEntry {
        invitee_id: notification.invitee_id,
        name: notification.data.clone(),
        position,
        distance_to_point_m: distance_meters(position, state.round_up),
    });
    state.status = SessionStatus::SessionActive;
    state.any_joined = true;

    Applied::InviteeJoined {
        invitee_id: notification.invitee_id,
        name: notification.data.clone(),
    }
}

fn apply_invitee_moved(role: &mut Role, notification: &Notification) -> Applied {
    let Role::Inviter(state) = role else {
        return Applied::Ignored;
    };

    let round_up = state.round_up;
    let Some(entry) = state
        .invitees
        .iter_mut()
        .find(|entry| entry.invitee_id == notification.invitee_id)
    else {
        return Applied::Ignored;
    };

    entry.position = GeoPoint::new(notification.latitude, notification.longitude);
    entry.distance_to_point_m = distance_meters(entry.position, round_up);

    Applied::InviteeMoved {
        invitee_id: notification.invitee_id,
    }
}

fn apply_invitee_left(role: &mut Role, notification: &Notification, arrived: bool) -> Applied {
    let Role::Inviter(state) = role else {
        return Applied::Ignored;
    };

    let before = state.invitees.len();
    state
        .invitees
        .retain(|entry| entry.invitee_id != notification.invitee_id);
    if state.invitees.len() == before {
        // Already removed (replay) or never joined.
        return Applied::Ignored;
    }

    Applied::InviteeLeft {
        invitee_id: notification.invitee_id,
        arrived,
        roster_empty: state.invitees.is_empty() && state.any_joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::InviterState;
    use rondo_protocol::{Recipient, UNASSIGNED_ID};

    fn inviter() -> Role {
        Role::Inviter(InviterState {
            session_id: 42,
            status: SessionStatus::SessionStarted,
            short_device_id: "ABCD1234".to_string(),
            round_up: GeoPoint::new(51.50, -0.12),
            invitees: Vec::new(),
            any_joined: false,
        })
    }

    fn joined(invitee_id: i64, name: &str) -> Notification {
        Notification {
            id: UNASSIGNED_ID,
            recipient: Recipient::Inviter.as_i32(),
            session_id: 42,
            invitee_id,
            message_id: "InviteeHasAccepted".to_string(),
            data: name.to_string(),
            short_device_id: "ABCD1234".to_string(),
            latitude: 51.49,
            longitude: -0.11,
        }
    }

    fn arrived(invitee_id: i64) -> Notification {
        Notification {
            message_id: "InviteeHasArrived".to_string(),
            ..joined(invitee_id, "")
        }
    }

    #[test]
    fn join_activates_the_session_and_adds_the_invitee() {
        let mut role = inviter();
        let applied = apply_notification(&mut role, &joined(7, "Bob"));
        assert_eq!(
            applied,
            Applied::InviteeJoined {
                invitee_id: 7,
                name: "Bob".to_string()
            }
        );

        let Role::Inviter(state) = &role else {
            panic!("role changed unexpectedly");
        };
        assert_eq!(state.status, SessionStatus::SessionActive);
        assert_eq!(state.invitees.len(), 1);
        assert!(state.invitees[0].distance_to_point_m > 0.0);
    }

    #[test]
    fn duplicate_join_is_a_no_op() {
        let mut role = inviter();
        apply_notification(&mut role, &joined(7, "Bob"));
        assert_eq!(
            apply_notification(&mut role, &joined(7, "Bob")),
            Applied::Ignored
        );

        let Role::Inviter(state) = &role else {
            panic!("role changed unexpectedly");
        };
        assert_eq!(state.invitees.len(), 1);
    }

    #[test]
    fn join_past_the_invitee_cap_is_ignored() {
        let mut role = inviter();
        for id in 1..=MAX_INVITEES as i64 {
            apply_notification(&mut role, &joined(id, "x"));
        }
        assert_eq!(
            apply_notification(&mut role, &joined(99, "over")),
            Applied::Ignored
        );

        let Role::Inviter(state) = &role else {
            panic!("role changed unexpectedly");
        };
        assert_eq!(state.invitees.len(), MAX_INVITEES);
    }

    #[test]
    fn location_update_moves_the_roster_entry() {
        let mut role = inviter();
        apply_notification(&mut role, &joined(7, "Bob"));

        let mut update = joined(7, "Bob");
        update.message_id = "InviteeLocationUpdate".to_string();
        update.latitude = 51.499;
        update.longitude = -0.121;
        assert_eq!(
            apply_notification(&mut role, &update),
            Applied::InviteeMoved { invitee_id: 7 }
        );

        let Role::Inviter(state) = &role else {
            panic!("role changed unexpectedly");
        };
        assert!(state.invitees[0].distance_to_point_m < 200.0);
    }

    #[test]
    fn location_update_for_unknown_invitee_is_ignored() {
        let mut role = inviter();
        let mut update = joined(99, "");
        update.message_id = "InviteeLocationUpdate".to_string();
        assert_eq!(apply_notification(&mut role, &update), Applied::Ignored);
    }

    #[test]
    fn last_arrival_empties_the_roster() {
        let mut role = inviter();
        apply_notification(&mut role, &joined(7, "Bob"));
        apply_notification(&mut role, &joined(8, "Ana"));

        assert_eq!(
            apply_notification(&mut role, &arrived(7)),
            Applied::InviteeLeft {
                invitee_id: 7,
                arrived: true,
                roster_empty: false
            }
        );
        assert_eq!(
            apply_notification(&mut role, &arrived(8)),
            Applied::InviteeLeft {
                invitee_id: 8,
                arrived: true,
                roster_empty: true
            }
        );
    }

    #[test]
    fn replayed_arrival_for_removed_invitee_is_a_no_op() {
        let mut role = inviter();
        apply_notification(&mut role, &joined(7, "Bob"));
        apply_notification(&mut role, &arrived(7));
        // Second delivery of the same arrival: no double close, no error.
        assert_eq!(apply_notification(&mut role, &arrived(7)), Applied::Ignored);
    }

    #[test]
    fn cancellation_notice_only_terminates_invitees() {
        let mut cancel = joined(UNASSIGNED_ID, "");
        cancel.message_id = "SessionCancelledByInviter".to_string();

        let mut role = inviter();
        assert_eq!(apply_notification(&mut role, &cancel), Applied::Ignored);
        assert!(role.is_inviter());

        let mut role = Role::Invitee(crate::state::types::InviteeState {
            session_id: 42,
            invitee_id: 7,
            session_status: SessionStatus::SessionActive,
            status: rondo_protocol::InviteeStatus::InviteeHasAccepted,
            inviter_short_device_id: "ABCD1234".to_string(),
            inviter_name: "Ana".to_string(),
            round_up: GeoPoint::new(51.50, -0.12),
        });
        assert_eq!(
            apply_notification(&mut role, &cancel),
            Applied::Terminated {
                reason: MessageId::SessionCancelledByInviter
            }
        );
        assert_eq!(role, Role::NoRole);
    }

    #[test]
    fn session_dead_terminates_either_role() {
        let mut dead = joined(UNASSIGNED_ID, "");
        dead.message_id = "SessionDead".to_string();

        let mut role = inviter();
        assert_eq!(
            apply_notification(&mut role, &dead),
            Applied::Terminated {
                reason: MessageId::SessionDead
            }
        );
        assert_eq!(role, Role::NoRole);
    }

    #[test]
    fn unknown_token_is_ignored() {
        let mut role = inviter();
        let mut odd = joined(7, "Bob");
        odd.message_id = "SomethingNew".to_string();
        assert_eq!(apply_notification(&mut role, &odd), Applied::Ignored);
    }

    #[test]
    fn terminal_while_no_role_is_ignored() {
        let mut role = Role::NoRole;
        let mut ended = joined(UNASSIGNED_ID, "");
        ended.message_id = "SessionHasEnded".to_string();
        assert_eq!(apply_notification(&mut role, &ended), Applied::Ignored);
    }
}
