//! The session state machine: owns the local view of role and status,
//! validates every outbound state-changing request, and applies inbound
//! notifications. All access is from the engine's owner thread.

use rondo_protocol::{
    InviteeStatus, Notification, SessionStatus, SHORT_DEVICE_ID_LEN, UNASSIGNED_ID,
};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::geofence::GeoPoint;

pub mod transition;
pub mod types;

pub use transition::{apply_notification, Applied};
pub use types::{InviteeState, InviterState, Role, RosterEntry, StateSnapshot};

#[derive(Debug)]
pub struct SessionStateMachine {
    role: Role,
    /// Notifications observed for the current session; the reconciler
    /// matches the backend log against this. Cleared at session boundaries.
    retained: Vec<Notification>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            role: Role::NoRole,
            retained: Vec::new(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn session_id(&self) -> i64 {
        self.role.session_id()
    }

    pub fn invitee_id(&self) -> i64 {
        self.role.invitee_id()
    }

    pub fn has_role(&self) -> bool {
        self.role.has_role()
    }

    /// The inviter's capability token, whichever side we're on.
    pub fn inviter_key(&self) -> &str {
        match &self.role {
            Role::Inviter(state) => &state.short_device_id,
            Role::Invitee(state) => &state.inviter_short_device_id,
            Role::NoRole => "",
        }
    }

    pub fn retained(&self) -> &[Notification] {
        &self.retained
    }

    pub fn retain(&mut self, notification: Notification) {
        self.retained.push(notification);
    }

    pub fn clear_retained(&mut self) {
        self.retained.clear();
    }

    /// Back to `NoRole` defaults; drops retained notifications.
    pub fn reset(&mut self) {
        if self.role.has_role() {
            info!(session_id = self.session_id(), "session state reset");
        }
        self.role = Role::NoRole;
        self.retained.clear();
    }

    // ---- outbound precondition checks (no network call on failure) ----

    pub fn check_can_start_session(&self, short_device_id: &str) -> Result<()> {
        if self.role.has_role() {
            return Err(EngineError::InvalidPrecondition(
                "already participating in a session",
            ));
        }
        if short_device_id.chars().count() != SHORT_DEVICE_ID_LEN {
            return Err(EngineError::InvalidPrecondition(
                "device id is not usable as a short device id",
            ));
        }
        Ok(())
    }

    pub fn check_can_accept_invite(&self) -> Result<()> {
        if self.role.has_role() {
            return Err(EngineError::InvalidPrecondition(
                "already participating in a session",
            ));
        }
        Ok(())
    }

    pub fn check_can_cancel_session(&self) -> Result<()> {
        match &self.role {
            Role::Inviter(state) if state.status.is_alive() => Ok(()),
            Role::Inviter(_) => Err(EngineError::InvalidPrecondition(
                "session is not alive",
            )),
            _ => Err(EngineError::InvalidPrecondition("not the inviter")),
        }
    }

    pub fn check_can_close_session(&self) -> Result<()> {
        self.check_can_cancel_session()
    }

    pub fn check_can_move_round_up_point(&self) -> Result<()> {
        self.check_can_cancel_session()
    }

    pub fn check_can_cancel_invitation(&self) -> Result<()> {
        match &self.role {
            Role::Invitee(_) => Ok(()),
            _ => Err(EngineError::InvalidPrecondition("not an invitee")),
        }
    }

    pub fn check_can_message(&self) -> Result<()> {
        if self.role.has_role() {
            Ok(())
        } else {
            Err(EngineError::InvalidPrecondition("no session to message"))
        }
    }

    // ---- role entry/exit ----

    /// Enter the inviter role after the backend assigned a session id.
    pub fn become_inviter(&mut self, session_id: i64, short_device_id: &str, round_up: GeoPoint) {
        debug_assert!(session_id != UNASSIGNED_ID);
        self.retained.clear();
        self.role = Role::Inviter(InviterState {
            session_id,
            status: SessionStatus::SessionStarted,
            short_device_id: short_device_id.to_string(),
            round_up,
            invitees: Vec::new(),
            any_joined: false,
        });
        info!(session_id, "acting as inviter");
    }

    /// Enter the invitee role after the backend accepted the join.
    pub fn become_invitee(
        &mut self,
        session_id: i64,
        invitee_id: i64,
        inviter_short_device_id: &str,
        inviter_name: &str,
        round_up: GeoPoint,
    ) {
        self.retained.clear();
        self.role = Role::Invitee(InviteeState {
            session_id,
            invitee_id,
            session_status: SessionStatus::SessionActive,
            status: InviteeStatus::InviteeHasAccepted,
            inviter_short_device_id: inviter_short_device_id.to_string(),
            inviter_name: inviter_name.to_string(),
            round_up,
        });
        info!(session_id, invitee_id, "acting as invitee");
    }

    /// Transient status set whenever a location-update request goes out.
    /// Reversible; arrival or cancellation overrides it.
    pub fn mark_en_route(&mut self) {
        if let Role::Invitee(state) = &mut self.role {
            state.status = InviteeStatus::InviteeIsEnRoute;
        }
    }

    /// Inviter moved the round-up point locally (after a successful
    /// broadcast request).
    pub fn set_round_up_point(&mut self, point: GeoPoint) {
        match &mut self.role {
            Role::Inviter(state) => state.round_up = point,
            Role::Invitee(state) => state.round_up = point,
            Role::NoRole => {}
        }
    }

    // ---- inbound ----

    /// Applies one notification through the transition rules, retaining it
    /// first so reconciliation can match it later. Used identically for live
    /// pushes and replayed ones, which is what makes replay idempotent.
    pub fn apply(&mut self, notification: &Notification) -> Applied {
        self.retained.push(notification.clone());
        let applied = apply_notification(&mut self.role, notification);
        if let Applied::Terminated { reason } = &applied {
            debug!(?reason, "session terminated by notification");
            self.retained.clear();
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rondo_protocol::Recipient;

    fn point() -> GeoPoint {
        GeoPoint::new(51.50, -0.12)
    }

    fn notification(message_id: &str, invitee_id: i64) -> Notification {
        Notification {
            id: UNASSIGNED_ID,
            recipient: Recipient::Inviter.as_i32(),
            session_id: 42,
            invitee_id,
            message_id: message_id.to_string(),
            data: "Bob".to_string(),
            short_device_id: "ABCD1234".to_string(),
            latitude: 51.49,
            longitude: -0.11,
        }
    }

    #[test]
    fn starting_requires_no_existing_role() {
        let mut machine = SessionStateMachine::new();
        assert!(machine.check_can_start_session("ABCD1234").is_ok());

        machine.become_inviter(42, "ABCD1234", point());
        assert_eq!(
            machine.check_can_start_session("ABCD1234"),
            Err(EngineError::InvalidPrecondition(
                "already participating in a session"
            ))
        );
        assert_eq!(
            machine.check_can_accept_invite(),
            Err(EngineError::InvalidPrecondition(
                "already participating in a session"
            ))
        );
    }

    #[test]
    fn starting_requires_an_eight_char_device_id() {
        let machine = SessionStateMachine::new();
        assert!(machine.check_can_start_session("short").is_err());
        assert!(machine.check_can_start_session("").is_err());
    }

    #[test]
    fn cancel_session_requires_a_live_inviter() {
        let mut machine = SessionStateMachine::new();
        assert!(machine.check_can_cancel_session().is_err());

        machine.become_invitee(42, 7, "ABCD1234", "Ana", point());
        assert!(machine.check_can_cancel_session().is_err());
        assert!(machine.check_can_cancel_invitation().is_ok());

        machine.reset();
        machine.become_inviter(42, "ABCD1234", point());
        assert!(machine.check_can_cancel_session().is_ok());
    }

    #[test]
    fn becoming_a_role_clears_prior_residue() {
        let mut machine = SessionStateMachine::new();
        machine.become_inviter(42, "ABCD1234", point());
        machine.retain(notification("InviteeHasAccepted", 7));

        machine.reset();
        assert!(!machine.has_role());
        assert!(machine.retained().is_empty());
        assert_eq!(machine.session_id(), UNASSIGNED_ID);
        assert_eq!(machine.invitee_id(), UNASSIGNED_ID);
    }

    #[test]
    fn applying_a_notification_retains_it() {
        let mut machine = SessionStateMachine::new();
        machine.become_inviter(42, "ABCD1234", point());

        machine.apply(&notification("InviteeHasAccepted", 7));
        assert_eq!(machine.retained().len(), 1);
        assert!(machine.role().is_inviter());
    }

    #[test]
    fn applying_twice_produces_the_same_state_as_once() {
        let mut machine = SessionStateMachine::new();
        machine.become_inviter(42, "ABCD1234", point());

        let join = notification("InviteeHasAccepted", 7);
        machine.apply(&join);
        let after_once = machine.role().clone();
        machine.apply(&join);
        assert_eq!(machine.role(), &after_once);
    }

    #[test]
    fn terminal_notification_resets_role_and_retained() {
        let mut machine = SessionStateMachine::new();
        machine.become_invitee(42, 7, "ABCD1234", "Ana", point());
        machine.apply(&notification("InstantMessage", UNASSIGNED_ID));
        assert!(!machine.retained().is_empty());

        let applied = machine.apply(&notification("SessionCancelledByInviter", UNASSIGNED_ID));
        assert!(matches!(applied, Applied::Terminated { .. }));
        assert!(!machine.has_role());
        assert!(machine.retained().is_empty());
    }

    #[test]
    fn en_route_is_transient_and_invitee_only() {
        let mut machine = SessionStateMachine::new();
        machine.mark_en_route();
        assert!(!machine.has_role());

        machine.become_invitee(42, 7, "ABCD1234", "Ana", point());
        machine.mark_en_route();
        let Role::Invitee(state) = machine.role() else {
            panic!("expected invitee role");
        };
        assert_eq!(state.status, InviteeStatus::InviteeIsEnRoute);
    }
}
