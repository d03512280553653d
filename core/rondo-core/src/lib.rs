//! Core library for rondo: the session synchronization and
//! notification-reconciliation engine.
//!
//! One state-owning task (the engine) composes the session state machine,
//! the reconciler, the geofence throttle and the push-channel lifecycle;
//! everything else talks to it through messages. The backend and the push
//! transport are injected collaborators, never ambient state.

pub mod channel;
pub mod clock;
pub mod engine;
pub mod error;
pub mod geofence;
pub mod reconcile;
pub mod state;
pub mod sync;

pub use channel::{ChannelErrorKind, ChannelState, PushChannel};
pub use clock::{Clock, SystemClock};
pub use engine::{
    Command, Engine, EngineConfig, EngineEvent, EngineHandle, Identity, RestoredRole,
    RestoredSession, UserOp,
};
pub use error::EngineError;
pub use geofence::{GeoPoint, GeofenceThrottle, TravelMode};
pub use state::{Role, SessionStateMachine, StateSnapshot};
pub use sync::http::HttpSyncClient;
pub use sync::SyncClient;
