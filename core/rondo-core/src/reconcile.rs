//! Notification reconciliation: after a resume, diff the locally retained
//! notifications against the backend's authoritative log and replay anything
//! missed, in log order, through the same handler live pushes use.
//!
//! The diff itself is pure so it can be tested without an engine; the engine
//! owns fetching and delivery.

use rondo_protocol::Notification;
use tracing::{debug, info};

use crate::state::SessionStateMachine;

/// What a reconciliation pass should deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayPlan {
    /// Everything logged was already observed.
    Nothing,
    /// The session is over. Deliver exactly this notification and nothing
    /// else: downstream handling of a terminal message resets all session
    /// state, so replaying what logically preceded it would be wasted work
    /// against already-dead state.
    Terminal(Notification),
    /// Deliver these, in backend log order. Later messages can depend on
    /// earlier state (an arrival after location updates), so order matters.
    Missed(Vec<Notification>),
}

/// Step 2 of the pass: retained notifications from a previous session are
/// useless for matching and are discarded wholesale. Returns true when the
/// retained list was cleared.
pub fn discard_stale_retained(machine: &mut SessionStateMachine) -> bool {
    let current = machine.session_id();
    let stale = machine
        .retained()
        .first()
        .is_some_and(|first| first.session_id != current);

    if stale {
        info!(
            session_id = current,
            "retained notifications are for another session; discarding"
        );
        machine.clear_retained();
    }
    stale
}

/// Steps 4-5: diff the backend log against the retained list.
///
/// Match rule: session-scoped entries (invitee id -1) match on message id
/// alone; invitee-scoped entries match on message id and invitee id.
pub fn plan_replay(retained: &[Notification], backend_log: &[Notification]) -> ReplayPlan {
    // Terminal short-circuit first: live pushes and reconciliation have no
    // mutual ordering guarantee, so a terminal entry anywhere in the log
    // wins outright.
    if let Some(terminal) = backend_log.iter().find(|n| n.message().is_terminal()) {
        info!(
            message = %terminal.message_id,
            "session finished; skipping replay of earlier notifications"
        );
        return ReplayPlan::Terminal(terminal.clone());
    }

    let missed: Vec<Notification> = backend_log
        .iter()
        .filter(|logged| !already_received(retained, logged))
        .cloned()
        .collect();

    if missed.is_empty() {
        debug!("no missed notifications");
        ReplayPlan::Nothing
    } else {
        info!(count = missed.len(), "replaying missed notifications");
        ReplayPlan::Missed(missed)
    }
}

fn already_received(retained: &[Notification], logged: &Notification) -> bool {
    retained.iter().any(|received| {
        if logged.is_session_scoped() {
            received.message_id == logged.message_id
        } else {
            received.message_id == logged.message_id && received.invitee_id == logged.invitee_id
        }
    })
}
