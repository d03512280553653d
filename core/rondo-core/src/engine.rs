//! The single state-owning task.
//!
//! One loop owns the state machine, the geofence throttle, the channel
//! lifecycle and the retained notification list. Every inbound stimulus
//! (caller commands, location fixes, push payloads, channel events, timer
//! expiries, completed backend calls) arrives as a message on one queue.
//! Backend calls run on short-lived worker threads and post their results
//! back, so the owner thread never blocks on the network.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rondo_protocol::invite::InviteCode;
use rondo_protocol::{parse_push_payload, MessageId, Notification, Recipient, UNASSIGNED_ID};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelErrorKind, PendingAction, PendingWait, PushChannel, ReconnectAdvice, WaitPolicy,
    WaitStart, WAIT_BUDGET,
};
use crate::clock::Clock;
use crate::error::EngineError;
use crate::geofence::{distance_meters, Decision, GeoPoint, GeofenceThrottle, TravelMode};
use crate::reconcile::{discard_stale_retained, plan_replay, ReplayPlan};
use crate::state::{Applied, Role, SessionStateMachine, StateSnapshot};
use crate::sync::{
    InstantMessageRequest, InviteeUpdate, JoinAccepted, JoinRequest, NewSession, OpResult,
    SessionHandle, SessionUpdate, SyncClient,
};

const INVITE_FRIENDLY_LINE: &str = "Tap the link (or paste it into rondo) to join my round-up:";

/// Who this device is. Injected at construction; the engine never reads
/// ambient state.
#[derive(Debug, Clone)]
pub struct Identity {
    /// 8-char token identifying this device, embedded in invite codes when
    /// acting as inviter.
    pub short_device_id: String,
    pub alias: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub identity: Identity,
    pub travel_mode: TravelMode,
    /// How long channel-gated operations wait for the channel before giving
    /// up. Tests shrink this.
    pub wait_budget: Duration,
}

impl EngineConfig {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            travel_mode: TravelMode::Walking,
            wait_budget: WAIT_BUDGET,
        }
    }
}

/// A session carried over from a previous process, rebuilt from the
/// flattened persistence snapshot. Restore then reconcile: the liveness
/// check inside reconciliation disposes of sessions that died while we were
/// gone.
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub role: RestoredRole,
    pub retained: Vec<Notification>,
}

#[derive(Debug, Clone)]
pub enum RestoredRole {
    Inviter {
        session_id: i64,
        round_up: GeoPoint,
    },
    Invitee {
        session_id: i64,
        invitee_id: i64,
        inviter_short_device_id: String,
        inviter_name: String,
        round_up: GeoPoint,
    },
}

/// Everything a caller can ask the engine to do or tell it about.
#[derive(Debug, Clone)]
pub enum Command {
    StartSession { point: GeoPoint },
    AcceptInvite { text: String, position: GeoPoint },
    CancelSession,
    CancelInvitation,
    CloseSession,
    MoveRoundUpPoint { point: GeoPoint },
    SendInstantMessage { text: String },
    SetTravelMode { mode: TravelMode },
    LocationChanged { position: GeoPoint },
    PushReceived { payload: String },
    ChannelConnecting,
    ChannelConnected { uri: String },
    ChannelDisconnected,
    ChannelError { kind: ChannelErrorKind },
    RestoreSession { restored: RestoredSession },
    Reconcile,
    Shutdown,
}

/// User-initiated operations, used to tag failures on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOp {
    StartSession,
    AcceptInvite,
    CancelSession,
    CancelInvitation,
    CloseSession,
    MoveRoundUpPoint,
    SendInstantMessage,
}

/// Events published to the boundary. Failures on user-initiated operations
/// are distinct from background failures: the latter must never interrupt
/// anyone with a dialog.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(StateSnapshot),
    /// Session started; this is the shareable invite text.
    InviteReady { text: String },
    OperationFailed { op: UserOp, error: EngineError },
    BackgroundFailure {
        context: &'static str,
        error: EngineError,
    },
    LongJourney { distance_m: f64, threshold_m: f64 },
    /// We reached the round-up point. Declared locally, independent of
    /// whether the arrival broadcast made it out.
    Arrived,
    SessionEnded { reason: MessageId },
    InstantMessage { invitee_id: i64, text: String },
    ChannelTrouble { kind: ChannelErrorKind },
    /// Channel dropped while acting as inviter; the transport should
    /// reconnect now.
    ReconnectRequested,
}

enum EngineMsg {
    Cmd(Command),
    Op(CompletedOp),
    WaitTimedOut { token: u64 },
}

/// A backend call finished on a worker thread.
enum CompletedOp {
    SessionStarted {
        result: OpResult<SessionHandle>,
        point: GeoPoint,
    },
    JoinCompleted {
        result: OpResult<JoinAccepted>,
        code: InviteCode,
        position: GeoPoint,
    },
    LocationBroadcast { result: OpResult<()> },
    ArrivalBroadcast { result: OpResult<()> },
    SessionCancelled { result: OpResult<()> },
    InvitationCancelled { result: OpResult<()> },
    SessionClosed { result: OpResult<()> },
    PointMoved {
        result: OpResult<()>,
        point: GeoPoint,
    },
    MessageSent { result: OpResult<()> },
    ChannelUriRefreshed { result: OpResult<()> },
    ReconcileFetched {
        alive: bool,
        result: OpResult<Vec<Notification>>,
    },
}

/// Cheap cloneable sender half; the boundary keeps one of these.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<EngineMsg>,
}

impl EngineHandle {
    pub fn send(&self, command: Command) {
        // A closed engine just drops the command.
        let _ = self.tx.send(EngineMsg::Cmd(command));
    }
}

pub struct Engine {
    sync: Arc<dyn SyncClient>,
    clock: Arc<dyn Clock>,
    identity: Identity,
    wait_budget: Duration,
    machine: SessionStateMachine,
    geofence: GeofenceThrottle,
    channel: PushChannel,
    /// `OperationInFlight` guard: one state-changing backend call at a time.
    busy: bool,
    current_position: Option<GeoPoint>,
    events: Sender<EngineEvent>,
    self_tx: Sender<EngineMsg>,
}

impl Engine {
    /// Starts the engine on its own thread and returns the command handle
    /// plus the event bus receiver.
    pub fn spawn(
        sync: Arc<dyn SyncClient>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> (EngineHandle, Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();

        let mut engine = Engine {
            sync,
            clock,
            identity: config.identity,
            wait_budget: config.wait_budget,
            machine: SessionStateMachine::new(),
            geofence: GeofenceThrottle::new(config.travel_mode),
            channel: PushChannel::new(),
            busy: false,
            current_position: None,
            events: event_tx,
            self_tx: tx.clone(),
        };
        thread::spawn(move || engine.run(rx));

        (EngineHandle { tx }, event_rx)
    }

    fn run(&mut self, rx: Receiver<EngineMsg>) {
        info!("engine loop started");
        while let Ok(msg) = rx.recv() {
            match msg {
                EngineMsg::Cmd(Command::Shutdown) => break,
                EngineMsg::Cmd(command) => self.handle_command(command),
                EngineMsg::Op(op) => self.handle_completed(op),
                EngineMsg::WaitTimedOut { token } => self.handle_wait_timeout(token),
            }
        }
        info!("engine loop stopped");
    }

    // ---- command dispatch ----

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartSession { point } => self.cmd_start_session(point),
            Command::AcceptInvite { text, position } => self.cmd_accept_invite(&text, position),
            Command::CancelSession => self.cmd_cancel_session(),
            Command::CancelInvitation => self.cmd_cancel_invitation(),
            Command::CloseSession => self.cmd_close_session(),
            Command::MoveRoundUpPoint { point } => self.cmd_move_round_up_point(point),
            Command::SendInstantMessage { text } => self.cmd_send_instant_message(text),
            Command::SetTravelMode { mode } => self.geofence.set_mode(mode),
            Command::LocationChanged { position } => self.cmd_location_changed(position),
            Command::PushReceived { payload } => self.cmd_push_received(&payload),
            Command::ChannelConnecting => self.channel.on_connecting(),
            Command::ChannelConnected { uri } => self.cmd_channel_connected(uri),
            Command::ChannelDisconnected => self.cmd_channel_disconnected(),
            Command::ChannelError { kind } => self.cmd_channel_error(kind),
            Command::RestoreSession { restored } => self.cmd_restore_session(restored),
            Command::Reconcile => self.cmd_reconcile(),
            Command::Shutdown => {}
        }
    }

    fn cmd_start_session(&mut self, point: GeoPoint) {
        if self.busy {
            return self.fail(UserOp::StartSession, EngineError::Busy);
        }
        if let Err(error) = self
            .machine
            .check_can_start_session(&self.identity.short_device_id)
        {
            return self.fail(UserOp::StartSession, error);
        }

        if let Some(uri) = self.gate_user_op(UserOp::StartSession, PendingAction::StartSession { point })
        {
            self.start_session_with_channel(uri, point);
        }
    }

    fn start_session_with_channel(&mut self, uri: String, point: GeoPoint) {
        let request = NewSession {
            channel: uri,
            latitude: point.latitude,
            longitude: point.longitude,
            short_device_id: self.identity.short_device_id.clone(),
            name: self.identity.alias.clone(),
            address: self.identity.address.clone(),
        };

        self.busy = true;
        self.spawn_op(move |sync| CompletedOp::SessionStarted {
            result: sync.start_session(&request),
            point,
        });
    }

    fn cmd_accept_invite(&mut self, text: &str, position: GeoPoint) {
        if self.busy {
            return self.fail(UserOp::AcceptInvite, EngineError::Busy);
        }
        let Some(code) = InviteCode::parse(text) else {
            return self.fail(UserOp::AcceptInvite, EngineError::BadInviteCode);
        };
        if let Err(error) = self.machine.check_can_accept_invite() {
            return self.fail(UserOp::AcceptInvite, error);
        }

        if let Some(uri) = self.gate_user_op(
            UserOp::AcceptInvite,
            PendingAction::AcceptInvite {
                code: code.clone(),
                position,
            },
        ) {
            self.accept_with_channel(uri, code, position);
        }
    }

    fn accept_with_channel(&mut self, uri: String, code: InviteCode, position: GeoPoint) {
        let request = JoinRequest {
            session_id: code.session_id,
            channel: uri,
            latitude: position.latitude,
            longitude: position.longitude,
            inviter_short_device_id: code.short_device_id.clone(),
            name: self.identity.alias.clone(),
            address: self.identity.address.clone(),
        };

        self.busy = true;
        self.spawn_op(move |sync| CompletedOp::JoinCompleted {
            result: sync.register_invitee(&request),
            code,
            position,
        });
    }

    fn cmd_cancel_session(&mut self) {
        if self.busy {
            return self.fail(UserOp::CancelSession, EngineError::Busy);
        }
        if let Err(error) = self.machine.check_can_cancel_session() {
            return self.fail(UserOp::CancelSession, error);
        }

        if let Some(uri) = self.gate_user_op(UserOp::CancelSession, PendingAction::CancelSession) {
            self.cancel_session_with_channel(uri);
        }
    }

    fn cancel_session_with_channel(&mut self, uri: String) {
        let Some(mut request) = self.session_update_at_round_up() else {
            return;
        };
        request.channel = uri;

        self.busy = true;
        self.spawn_op(move |sync| CompletedOp::SessionCancelled {
            result: sync.cancel_session(&request),
        });
    }

    fn cmd_cancel_invitation(&mut self) {
        if self.busy {
            return self.fail(UserOp::CancelInvitation, EngineError::Busy);
        }
        if let Err(error) = self.machine.check_can_cancel_invitation() {
            return self.fail(UserOp::CancelInvitation, error);
        }

        if let Some(uri) =
            self.gate_user_op(UserOp::CancelInvitation, PendingAction::CancelInvitation)
        {
            self.cancel_invitation_with_channel(uri);
        }
    }

    fn cancel_invitation_with_channel(&mut self, uri: String) {
        let position = self.position_or_round_up();
        let Some(mut request) = self.invitee_update(position) else {
            return;
        };
        request.channel = uri;

        self.busy = true;
        self.spawn_op(move |sync| CompletedOp::InvitationCancelled {
            result: sync.cancel_invitee(&request),
        });
    }

    fn cmd_close_session(&mut self) {
        if self.busy {
            return self.fail(UserOp::CloseSession, EngineError::Busy);
        }
        if let Err(error) = self.machine.check_can_close_session() {
            return self.fail(UserOp::CloseSession, error);
        }

        if let Some(uri) = self.gate_user_op(UserOp::CloseSession, PendingAction::CloseSession) {
            self.close_session_with_channel(uri);
        }
    }

    fn close_session_with_channel(&mut self, uri: String) {
        let Some(mut request) = self.session_update_at_round_up() else {
            return;
        };
        request.channel = uri;

        self.busy = true;
        self.spawn_op(move |sync| CompletedOp::SessionClosed {
            result: sync.close_session(&request),
        });
    }

    fn cmd_move_round_up_point(&mut self, point: GeoPoint) {
        if self.busy {
            return self.fail(UserOp::MoveRoundUpPoint, EngineError::Busy);
        }
        if let Err(error) = self.machine.check_can_move_round_up_point() {
            return self.fail(UserOp::MoveRoundUpPoint, error);
        }

        if let Some(uri) = self.gate_user_op(
            UserOp::MoveRoundUpPoint,
            PendingAction::MoveRoundUpPoint { point },
        ) {
            self.move_point_with_channel(uri, point);
        }
    }

    fn move_point_with_channel(&mut self, uri: String, point: GeoPoint) {
        let Some(mut request) = self.session_update(point) else {
            return;
        };
        request.channel = uri;

        self.busy = true;
        self.spawn_op(move |sync| CompletedOp::PointMoved {
            result: sync.move_round_up_point(&request),
            point,
        });
    }

    fn cmd_send_instant_message(&mut self, text: String) {
        if let Err(error) = self.machine.check_can_message() {
            return self.fail(UserOp::SendInstantMessage, error);
        }

        if let Some(uri) = self.gate_user_op(
            UserOp::SendInstantMessage,
            PendingAction::SendInstantMessage { text: text.clone() },
        ) {
            self.message_with_channel(uri, text);
        }
    }

    fn message_with_channel(&mut self, uri: String, text: String) {
        if !self.machine.has_role() {
            return;
        }
        let request = InstantMessageRequest {
            session_id: self.machine.session_id(),
            invitee_id: self.machine.invitee_id(),
            channel: uri,
            inviter_short_device_id: self.machine.inviter_key().to_string(),
            from_name: self.identity.alias.clone(),
            text,
        };

        self.spawn_op(move |sync| CompletedOp::MessageSent {
            result: sync.send_instant_message(&request),
        });
    }

    fn cmd_location_changed(&mut self, position: GeoPoint) {
        self.current_position = Some(position);
        if !self.machine.role().is_invitee() {
            // Inviters move the round-up point explicitly; their own
            // position is not broadcast.
            return;
        }

        match self.geofence.observe(position) {
            Decision::Ignore => {}
            Decision::Arrived => self.complete_arrival(position),
            Decision::Broadcast => self.broadcast_location(position),
        }
    }

    fn broadcast_location(&mut self, position: GeoPoint) {
        let Some(request) = self.invitee_update(position) else {
            return;
        };

        match self.channel.begin_wait(
            PendingAction::BroadcastLocation {
                request: request.clone(),
            },
            WaitPolicy::Silent,
        ) {
            Ok(WaitStart::Ready(uri)) => {
                let mut request = request;
                request.channel = uri;
                self.spawn_location_broadcast(request);
            }
            Ok(WaitStart::Waiting { token }) => self.arm_wait_timer(token),
            Err(_) => {
                debug!("channel wait already pending; dropping this location sample");
            }
        }
    }

    fn spawn_location_broadcast(&mut self, request: InviteeUpdate) {
        // Transient en-route status is set whenever the request goes out.
        self.machine.mark_en_route();
        self.spawn_op(move |sync| CompletedOp::LocationBroadcast {
            result: sync.update_invitee_location(&request),
        });
    }

    /// Arrival is a local geometric fact: the role resets and the caller is
    /// told, whether or not the broadcast makes it to the backend.
    fn complete_arrival(&mut self, position: GeoPoint) {
        if let Some(mut request) = self.invitee_update(position) {
            if self.busy {
                debug!("operation in flight; arrival broadcast skipped");
            } else if let Some(uri) = self.channel.uri().map(str::to_string) {
                request.channel = uri;
                self.spawn_op(move |sync| CompletedOp::ArrivalBroadcast {
                    result: sync.mark_arrived(&request),
                });
            } else {
                debug!("push channel not ready; arrival broadcast dropped");
            }
        }

        info!("arrived at the round-up point");
        self.publish(EngineEvent::Arrived);
        self.reset_session_state();
    }

    fn cmd_push_received(&mut self, payload: &str) {
        let notification = match parse_push_payload(payload) {
            Ok(notification) => notification,
            Err(err) => {
                warn!(error = %err, "push payload unreadable; dropped");
                return;
            }
        };

        if !self.machine.has_role() {
            debug!("push received with no active session; ignored");
            return;
        }
        if notification.session_id != self.machine.session_id() {
            debug!(
                push_session = notification.session_id,
                current_session = self.machine.session_id(),
                "push for another session; ignored"
            );
            return;
        }

        self.apply_notification(&notification);
    }

    fn cmd_channel_connected(&mut self, uri: String) {
        let waiter = self.channel.on_connected(uri.clone());
        self.refresh_channel_uri(&uri);
        if let Some(pending) = waiter {
            self.resume_pending(pending, uri);
        }
    }

    fn cmd_channel_disconnected(&mut self) {
        let acting_as_inviter = self.machine.role().is_inviter();
        match self.channel.on_disconnected(acting_as_inviter) {
            ReconnectAdvice::ReconnectNow => self.publish(EngineEvent::ReconnectRequested),
            ReconnectAdvice::Defer => {}
        }
    }

    fn cmd_channel_error(&mut self, kind: ChannelErrorKind) {
        if let Some(pending) = self.channel.on_error(kind) {
            self.fail_pending(pending);
        }
        self.publish(EngineEvent::ChannelTrouble { kind });
    }

    fn cmd_restore_session(&mut self, restored: RestoredSession) {
        if self.machine.has_role() || self.busy {
            debug!("restore ignored; a session is already active");
            return;
        }

        match restored.role {
            RestoredRole::Inviter {
                session_id,
                round_up,
            } => {
                self.machine
                    .become_inviter(session_id, &self.identity.short_device_id, round_up);
                self.geofence.reset();
                self.geofence.set_round_up_point(round_up);
            }
            RestoredRole::Invitee {
                session_id,
                invitee_id,
                inviter_short_device_id,
                inviter_name,
                round_up,
            } => {
                self.machine.become_invitee(
                    session_id,
                    invitee_id,
                    &inviter_short_device_id,
                    &inviter_name,
                    round_up,
                );
                self.geofence.reset();
                self.geofence.set_round_up_point(round_up);
            }
        }

        for notification in restored.retained {
            self.machine.retain(notification);
        }
        info!(session_id = self.machine.session_id(), "session restored");
        self.publish_state();
    }

    /// Repairs any gap caused by missed pushes. Preconditions (role set,
    /// connectivity) are checked here and in the worker; an unreachable
    /// backend defers silently to the next resume.
    fn cmd_reconcile(&mut self) {
        if !self.machine.has_role() {
            debug!("no role; reconciliation skipped");
            return;
        }

        discard_stale_retained(&mut self.machine);

        let session_id = self.machine.session_id();
        let invitee_id = self.machine.invitee_id();
        let recipient_is_inviter = self.machine.role().is_inviter();

        let sync = Arc::clone(&self.sync);
        let tx = self.self_tx.clone();
        thread::spawn(move || {
            if !sync.network_available() {
                debug!("offline; reconciliation deferred");
                return;
            }
            let alive = match sync.is_session_alive(session_id) {
                Ok(alive) => alive,
                Err(failure) => {
                    debug!(?failure, "liveness check failed; reconciliation deferred");
                    return;
                }
            };
            if !alive {
                let _ = tx.send(EngineMsg::Op(CompletedOp::ReconcileFetched {
                    alive: false,
                    result: Ok(Vec::new()),
                }));
                return;
            }

            let result = sync.stored_notifications(session_id, invitee_id, recipient_is_inviter);
            let _ = tx.send(EngineMsg::Op(CompletedOp::ReconcileFetched {
                alive: true,
                result,
            }));
        });
    }

    // ---- completions ----

    fn handle_completed(&mut self, op: CompletedOp) {
        match op {
            CompletedOp::SessionStarted { result, point } => {
                self.busy = false;
                match result {
                    Ok(handle) => {
                        self.machine.become_inviter(
                            handle.session_id,
                            &self.identity.short_device_id,
                            point,
                        );
                        self.geofence.reset();
                        self.geofence.set_round_up_point(point);

                        let code = InviteCode {
                            session_id: handle.session_id,
                            short_device_id: self.identity.short_device_id.clone(),
                            alias: self.identity.alias.clone(),
                        };
                        self.publish(EngineEvent::InviteReady {
                            text: code.render(INVITE_FRIENDLY_LINE),
                        });
                        self.publish_state();
                    }
                    Err(failure) => self.fail(UserOp::StartSession, failure.into_engine_error()),
                }
            }

            CompletedOp::JoinCompleted {
                result,
                code,
                position,
            } => {
                self.busy = false;
                match result {
                    Ok(accepted) => self.finish_join(&code, &accepted, position),
                    Err(failure) => self.fail(UserOp::AcceptInvite, failure.into_engine_error()),
                }
            }

            CompletedOp::LocationBroadcast { result } => {
                if let Err(failure) = result {
                    self.background_failure("location broadcast", failure.into_engine_error());
                }
            }

            CompletedOp::ArrivalBroadcast { result } => {
                if let Err(failure) = result {
                    self.background_failure("arrival broadcast", failure.into_engine_error());
                }
            }

            CompletedOp::SessionCancelled { result } => {
                self.busy = false;
                match result {
                    Ok(()) => {
                        self.publish(EngineEvent::SessionEnded {
                            reason: MessageId::SessionCancelledByInviter,
                        });
                        self.reset_session_state();
                    }
                    Err(failure) => self.fail(UserOp::CancelSession, failure.into_engine_error()),
                }
            }

            CompletedOp::InvitationCancelled { result } => {
                self.busy = false;
                match result {
                    Ok(()) => {
                        self.publish(EngineEvent::SessionEnded {
                            reason: MessageId::InviteeHasCancelled,
                        });
                        self.reset_session_state();
                    }
                    Err(failure) => {
                        self.fail(UserOp::CancelInvitation, failure.into_engine_error())
                    }
                }
            }

            CompletedOp::SessionClosed { result } => {
                self.busy = false;
                match result {
                    Ok(()) => {
                        self.publish(EngineEvent::SessionEnded {
                            reason: MessageId::SessionHasEnded,
                        });
                        self.reset_session_state();
                    }
                    Err(failure) => self.fail(UserOp::CloseSession, failure.into_engine_error()),
                }
            }

            CompletedOp::PointMoved { result, point } => {
                self.busy = false;
                match result {
                    Ok(()) => {
                        self.machine.set_round_up_point(point);
                        self.geofence.set_round_up_point(point);
                        self.publish_state();
                    }
                    Err(failure) => {
                        self.fail(UserOp::MoveRoundUpPoint, failure.into_engine_error())
                    }
                }
            }

            CompletedOp::MessageSent { result } => {
                if let Err(failure) = result {
                    self.fail(UserOp::SendInstantMessage, failure.into_engine_error());
                }
            }

            CompletedOp::ChannelUriRefreshed { result } => {
                if let Err(failure) = result {
                    self.background_failure("channel uri refresh", failure.into_engine_error());
                }
            }

            CompletedOp::ReconcileFetched { alive, result } => {
                self.finish_reconcile(alive, result)
            }
        }
    }

    fn finish_join(&mut self, code: &InviteCode, accepted: &JoinAccepted, position: GeoPoint) {
        let round_up = GeoPoint::new(accepted.round_up_latitude, accepted.round_up_longitude);
        self.machine.become_invitee(
            accepted.session_id,
            accepted.invitee_id,
            &code.short_device_id,
            &accepted.inviter_name,
            round_up,
        );

        // Mirror our own join locally so reconciliation never replays it.
        self.machine.retain(Notification {
            id: UNASSIGNED_ID,
            recipient: Recipient::Invitee.as_i32(),
            session_id: accepted.session_id,
            invitee_id: accepted.invitee_id,
            message_id: MessageId::InviteeHasAccepted.as_str().to_string(),
            data: accepted.inviter_name.clone(),
            short_device_id: code.short_device_id.clone(),
            latitude: round_up.latitude,
            longitude: round_up.longitude,
        });

        self.geofence.reset();
        self.geofence.set_round_up_point(round_up);
        self.publish_state();

        // The join itself carried our position, so it becomes the broadcast
        // baseline. We might even be standing at the point already.
        if self.geofence.observe(position) == Decision::Arrived {
            return self.complete_arrival(position);
        }

        let distance = distance_meters(position, round_up);
        if let Some(notice) = self.geofence.plan_journey(distance) {
            self.publish(EngineEvent::LongJourney {
                distance_m: notice.distance_m,
                threshold_m: notice.new_threshold_m,
            });
        }
    }

    fn finish_reconcile(&mut self, alive: bool, result: OpResult<Vec<Notification>>) {
        if !alive {
            // Dead or never-alive session discovered out-of-band (the
            // expiry sweep updates status without notifying anyone).
            info!("session is dead or was never alive; resetting");
            self.publish(EngineEvent::SessionEnded {
                reason: MessageId::SessionDead,
            });
            self.reset_session_state();
            return;
        }

        let backend_log = match result {
            Ok(log) => log,
            Err(failure) => {
                debug!(?failure, "notification log fetch failed; reconciliation deferred");
                return;
            }
        };

        match plan_replay(self.machine.retained(), &backend_log) {
            ReplayPlan::Nothing => {}
            ReplayPlan::Terminal(notification) => self.apply_notification(&notification),
            ReplayPlan::Missed(notifications) => {
                for notification in &notifications {
                    self.apply_notification(notification);
                }
            }
        }
    }

    // ---- inbound notification application ----

    /// One handler for live pushes and replayed ones.
    fn apply_notification(&mut self, notification: &Notification) {
        match self.machine.apply(notification) {
            Applied::Ignored => {}
            Applied::InviteeJoined { invitee_id, name } => {
                info!(invitee_id, name = %name, "invitee joined");
                self.publish_state();
            }
            Applied::InviteeMoved { .. } => self.publish_state(),
            Applied::InviteeLeft {
                invitee_id,
                arrived,
                roster_empty,
            } => {
                info!(invitee_id, arrived, "invitee left the session");
                self.publish_state();
                if roster_empty {
                    info!("all invitees arrived or cancelled; closing session");
                    self.cmd_close_session();
                }
            }
            Applied::RoundUpMoved { point } => {
                self.geofence.set_round_up_point(point);
                self.publish_state();
            }
            Applied::Message { invitee_id, text } => {
                self.publish(EngineEvent::InstantMessage { invitee_id, text });
            }
            Applied::Terminated { reason } => {
                self.publish(EngineEvent::SessionEnded { reason });
                self.reset_session_state();
            }
        }
    }

    // ---- plumbing ----

    /// Channel gate for user-initiated operations: returns the uri when the
    /// channel is ready now, otherwise parks the action (noisy timeout).
    fn gate_user_op(&mut self, op: UserOp, action: PendingAction) -> Option<String> {
        match self.channel.begin_wait(action, WaitPolicy::Noisy) {
            Ok(WaitStart::Ready(uri)) => Some(uri),
            Ok(WaitStart::Waiting { token }) => {
                self.arm_wait_timer(token);
                None
            }
            Err(_) => {
                self.fail(op, EngineError::Busy);
                None
            }
        }
    }

    fn arm_wait_timer(&self, token: u64) {
        let tx = self.self_tx.clone();
        let budget = self.wait_budget;
        thread::spawn(move || {
            thread::sleep(budget);
            let _ = tx.send(EngineMsg::WaitTimedOut { token });
        });
    }

    fn handle_wait_timeout(&mut self, token: u64) {
        // A stale token means the waiter already resumed; nothing to do.
        if let Some(pending) = self.channel.take_waiter_if(token) {
            self.fail_pending(pending);
        }
    }

    fn fail_pending(&mut self, pending: PendingWait) {
        match pending.policy {
            WaitPolicy::Noisy => {
                if let Some(op) = user_op_for(&pending.action) {
                    self.fail(op, EngineError::ChannelUnavailable);
                }
            }
            WaitPolicy::Silent => {
                debug!("channel never became ready; background broadcast dropped");
            }
        }
    }

    fn resume_pending(&mut self, pending: PendingWait, uri: String) {
        match pending.action {
            PendingAction::StartSession { point } => self.start_session_with_channel(uri, point),
            PendingAction::AcceptInvite { code, position } => {
                self.accept_with_channel(uri, code, position)
            }
            PendingAction::CancelSession => self.cancel_session_with_channel(uri),
            PendingAction::CancelInvitation => self.cancel_invitation_with_channel(uri),
            PendingAction::CloseSession => self.close_session_with_channel(uri),
            PendingAction::MoveRoundUpPoint { point } => self.move_point_with_channel(uri, point),
            PendingAction::BroadcastLocation { mut request } => {
                request.channel = uri;
                self.spawn_location_broadcast(request);
            }
            PendingAction::SendInstantMessage { text } => self.message_with_channel(uri, text),
        }
    }

    /// Keeps the backend's copy of our push endpoint current whenever the
    /// channel (re)connects with a role active.
    fn refresh_channel_uri(&mut self, uri: &str) {
        match self.machine.role() {
            Role::Inviter(state) if state.session_id != UNASSIGNED_ID => {
                let round_up = state.round_up;
                let Some(mut request) = self.session_update(round_up) else {
                    return;
                };
                request.channel = uri.to_string();
                self.spawn_op(move |sync| CompletedOp::ChannelUriRefreshed {
                    result: sync.update_inviter_channel_uri(&request),
                });
            }
            Role::Invitee(state) => {
                let fallback = state.round_up;
                let position = self.current_position.unwrap_or(fallback);
                let Some(mut request) = self.invitee_update(position) else {
                    return;
                };
                request.channel = uri.to_string();
                self.spawn_op(move |sync| CompletedOp::ChannelUriRefreshed {
                    result: sync.update_invitee_channel_uri(&request),
                });
            }
            _ => {}
        }
    }

    fn reset_session_state(&mut self) {
        self.machine.reset();
        self.geofence.reset();
        self.channel.cancel_wait();
        self.busy = false;
        self.publish_state();
    }

    fn session_update(&self, point: GeoPoint) -> Option<SessionUpdate> {
        let Role::Inviter(state) = self.machine.role() else {
            return None;
        };
        Some(SessionUpdate {
            session_id: state.session_id,
            short_device_id: state.short_device_id.clone(),
            channel: self.channel.uri().unwrap_or_default().to_string(),
            latitude: point.latitude,
            longitude: point.longitude,
            name: self.identity.alias.clone(),
            address: self.identity.address.clone(),
        })
    }

    fn session_update_at_round_up(&self) -> Option<SessionUpdate> {
        let Role::Inviter(state) = self.machine.role() else {
            return None;
        };
        let round_up = state.round_up;
        self.session_update(round_up)
    }

    fn invitee_update(&self, position: GeoPoint) -> Option<InviteeUpdate> {
        let Role::Invitee(state) = self.machine.role() else {
            return None;
        };
        Some(InviteeUpdate {
            invitee_id: state.invitee_id,
            session_id: state.session_id,
            channel: self.channel.uri().unwrap_or_default().to_string(),
            latitude: position.latitude,
            longitude: position.longitude,
            inviter_short_device_id: state.inviter_short_device_id.clone(),
            name: self.identity.alias.clone(),
            data: String::new(),
        })
    }

    fn position_or_round_up(&self) -> GeoPoint {
        self.current_position
            .or_else(|| self.geofence.round_up_point())
            .unwrap_or(GeoPoint::new(0.0, 0.0))
    }

    fn spawn_op<F>(&self, work: F)
    where
        F: FnOnce(&dyn SyncClient) -> CompletedOp + Send + 'static,
    {
        let sync = Arc::clone(&self.sync);
        let tx = self.self_tx.clone();
        thread::spawn(move || {
            let op = work(sync.as_ref());
            let _ = tx.send(EngineMsg::Op(op));
        });
    }

    fn fail(&self, op: UserOp, error: EngineError) {
        warn!(?op, %error, "operation failed");
        self.publish(EngineEvent::OperationFailed { op, error });
    }

    fn background_failure(&self, context: &'static str, error: EngineError) {
        debug!(context, %error, "background operation failed");
        self.publish(EngineEvent::BackgroundFailure { context, error });
    }

    fn publish_state(&self) {
        self.publish(EngineEvent::StateChanged(StateSnapshot {
            role: self.machine.role().clone(),
            retained: self.machine.retained().to_vec(),
            changed_at: self.clock.now(),
        }));
    }

    fn publish(&self, event: EngineEvent) {
        // The boundary may have gone away; state keeps advancing regardless.
        let _ = self.events.send(event);
    }
}

fn user_op_for(action: &PendingAction) -> Option<UserOp> {
    match action {
        PendingAction::StartSession { .. } => Some(UserOp::StartSession),
        PendingAction::AcceptInvite { .. } => Some(UserOp::AcceptInvite),
        PendingAction::CancelSession => Some(UserOp::CancelSession),
        PendingAction::CancelInvitation => Some(UserOp::CancelInvitation),
        PendingAction::CloseSession => Some(UserOp::CloseSession),
        PendingAction::MoveRoundUpPoint { .. } => Some(UserOp::MoveRoundUpPoint),
        PendingAction::SendInstantMessage { .. } => Some(UserOp::SendInstantMessage),
        PendingAction::BroadcastLocation { .. } => None,
    }
}
