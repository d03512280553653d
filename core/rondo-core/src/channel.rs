//! Push-channel lifecycle: gates operations that need a push endpoint uri
//! and serializes exactly one waiting continuation at a time.
//!
//! The transport itself lives outside the engine; this module only tracks
//! its state and owns the single pending "call me when the channel is ready"
//! slot.

use std::time::Duration;

use rondo_protocol::invite::InviteCode;
use tracing::{debug, warn};

use crate::geofence::GeoPoint;
use crate::sync::InviteeUpdate;

/// How long a waiter is allowed to sit before it times out.
pub const WAIT_BUDGET: Duration = Duration::from_secs(30);

/// Classified transport errors. None of these auto-retry; each is either
/// user-actionable or fatal to the session from this component's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    /// Often a device-side problem (wrong clock is a known cause).
    ChannelOpenFailed,
    NotificationRateTooHigh,
    PowerLevelChanged,
    PayloadFormat,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected(String),
    Error(ChannelErrorKind),
}

/// Whether a timed-out wait is surfaced to the user or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// User-initiated operation; a timeout becomes a visible failure.
    Noisy,
    /// Background operation; a timeout drops the work silently.
    Silent,
}

/// The continuation to resume once the channel reports ready. Location
/// broadcasts carry their whole request because the session may reset while
/// the waiter is parked; the captured ids stay valid for the send.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    StartSession { point: GeoPoint },
    AcceptInvite { code: InviteCode, position: GeoPoint },
    CancelSession,
    CancelInvitation,
    CloseSession,
    MoveRoundUpPoint { point: GeoPoint },
    BroadcastLocation { request: InviteeUpdate },
    SendInstantMessage { text: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWait {
    pub token: u64,
    pub action: PendingAction,
    pub policy: WaitPolicy,
}

/// Outcome of asking to run an action when the channel is ready.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitStart {
    /// Channel already connected; run the action now with this uri.
    Ready(String),
    /// Waiter registered; a timer for `token` should be armed.
    Waiting { token: u64 },
}

/// A second `begin_wait` while one waiter is pending is a caller error;
/// callers check `waiting()` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterAlreadyPending;

#[derive(Debug)]
pub struct PushChannel {
    state: ChannelState,
    waiter: Option<PendingWait>,
    next_token: u64,
}

impl Default for PushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PushChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            waiter: None,
            next_token: 1,
        }
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.state {
            ChannelState::Connected(uri) => Some(uri),
            _ => None,
        }
    }

    pub fn waiting(&self) -> bool {
        self.waiter.is_some()
    }

    /// Registers `action` to run once the channel is ready. Fires
    /// synchronously when already connected.
    pub fn begin_wait(
        &mut self,
        action: PendingAction,
        policy: WaitPolicy,
    ) -> Result<WaitStart, WaiterAlreadyPending> {
        if let ChannelState::Connected(uri) = &self.state {
            return Ok(WaitStart::Ready(uri.clone()));
        }
        if self.waiter.is_some() {
            return Err(WaiterAlreadyPending);
        }

        let token = self.next_token;
        self.next_token += 1;
        debug!(token, ?policy, "waiting for push channel");
        self.waiter = Some(PendingWait {
            token,
            action,
            policy,
        });
        Ok(WaitStart::Waiting { token })
    }

    pub fn on_connecting(&mut self) {
        self.state = ChannelState::Connecting;
    }

    /// Channel became ready. Returns the waiter (if any) for the engine to
    /// resume.
    pub fn on_connected(&mut self, uri: String) -> Option<PendingWait> {
        self.state = ChannelState::Connected(uri);
        self.waiter.take()
    }

    /// Channel dropped. Inviters reconnect immediately; invitees defer to
    /// the next operation's wait.
    pub fn on_disconnected(&mut self, acting_as_inviter: bool) -> ReconnectAdvice {
        self.state = ChannelState::Disconnected;
        if acting_as_inviter {
            ReconnectAdvice::ReconnectNow
        } else {
            ReconnectAdvice::Defer
        }
    }

    /// Classified transport error. The pending waiter (if any) is returned
    /// so the engine can fail or drop it per its policy.
    pub fn on_error(&mut self, kind: ChannelErrorKind) -> Option<PendingWait> {
        warn!(?kind, "push channel error");
        self.state = ChannelState::Error(kind);
        self.waiter.take()
    }

    /// Timeout path: takes the waiter only when `token` still matches. A
    /// stale token (waiter already resumed or replaced) is a no-op.
    pub fn take_waiter_if(&mut self, token: u64) -> Option<PendingWait> {
        if self.waiter.as_ref().is_some_and(|w| w.token == token) {
            return self.waiter.take();
        }
        None
    }

    /// Drops any pending waiter, e.g. on session reset.
    pub fn cancel_wait(&mut self) {
        if self.waiter.take().is_some() {
            debug!("pending channel wait cancelled");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAdvice {
    ReconnectNow,
    Defer,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel_action() -> PendingAction {
        PendingAction::CancelSession
    }

    #[test]
    fn begin_wait_fires_synchronously_when_connected() {
        let mut channel = PushChannel::new();
        channel.on_connected("https://push.example/abc".to_string());

        let start = channel
            .begin_wait(cancel_action(), WaitPolicy::Noisy)
            .expect("no waiter pending");
        assert_eq!(start, WaitStart::Ready("https://push.example/abc".to_string()));
        assert!(!channel.waiting());
    }

    #[test]
    fn second_wait_while_pending_is_a_caller_error() {
        let mut channel = PushChannel::new();
        assert!(matches!(
            channel.begin_wait(cancel_action(), WaitPolicy::Noisy),
            Ok(WaitStart::Waiting { .. })
        ));
        assert_eq!(
            channel.begin_wait(cancel_action(), WaitPolicy::Noisy),
            Err(WaiterAlreadyPending)
        );
    }

    #[test]
    fn connect_resumes_and_clears_the_waiter() {
        let mut channel = PushChannel::new();
        channel
            .begin_wait(cancel_action(), WaitPolicy::Noisy)
            .expect("registered");

        let resumed = channel.on_connected("uri".to_string()).expect("waiter");
        assert_eq!(resumed.action, PendingAction::CancelSession);
        assert!(!channel.waiting());

        // A later wait can register again.
        assert!(channel
            .begin_wait(cancel_action(), WaitPolicy::Silent)
            .is_ok());
    }

    #[test]
    fn timeout_with_stale_token_is_a_no_op() {
        let mut channel = PushChannel::new();
        let token = match channel.begin_wait(cancel_action(), WaitPolicy::Silent) {
            Ok(WaitStart::Waiting { token }) => token,
            other => panic!("unexpected {other:?}"),
        };

        // Waiter resumes before its timer fires.
        channel.on_connected("uri".to_string());
        assert!(channel.take_waiter_if(token).is_none());
    }

    #[test]
    fn timeout_with_live_token_takes_the_waiter() {
        let mut channel = PushChannel::new();
        let token = match channel.begin_wait(cancel_action(), WaitPolicy::Silent) {
            Ok(WaitStart::Waiting { token }) => token,
            other => panic!("unexpected {other:?}"),
        };

        let taken = channel.take_waiter_if(token).expect("waiter");
        assert_eq!(taken.policy, WaitPolicy::Silent);
        assert!(!channel.waiting());
    }

    #[test]
    fn disconnect_advice_depends_on_role() {
        let mut channel = PushChannel::new();
        channel.on_connected("uri".to_string());
        assert_eq!(channel.on_disconnected(true), ReconnectAdvice::ReconnectNow);

        channel.on_connected("uri".to_string());
        assert_eq!(channel.on_disconnected(false), ReconnectAdvice::Defer);
    }

    #[test]
    fn error_surfaces_the_waiter_and_parks_the_state() {
        let mut channel = PushChannel::new();
        channel
            .begin_wait(cancel_action(), WaitPolicy::Noisy)
            .expect("registered");

        let waiter = channel.on_error(ChannelErrorKind::ChannelOpenFailed);
        assert!(waiter.is_some());
        assert_eq!(
            channel.state(),
            &ChannelState::Error(ChannelErrorKind::ChannelOpenFailed)
        );
    }
}
