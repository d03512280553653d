//! Session snapshot persistence in the flattened pipe-delimited format.
//!
//! First line is the header (version, role, ids, round-up point); every
//! following line is one retained notification. A corrupt header discards
//! the whole snapshot; a corrupt notification line discards only that
//! record. Restore never fails loudly; worst case the user re-joins.

use std::path::Path;

use fs_err as fs;
use rondo_core::{GeoPoint, RestoredRole, RestoredSession, Role, StateSnapshot};
use rondo_protocol::flat::{notification_from_flat, notification_to_flat};
use tracing::{debug, warn};

const SNAPSHOT_VERSION: &str = "RONDO1";

/// Writes the snapshot, or removes it when there is no session to keep.
pub fn save(path: &Path, snapshot: &StateSnapshot) -> Result<(), String> {
    let header = match &snapshot.role {
        Role::NoRole => {
            if path.exists() {
                fs::remove_file(path)
                    .map_err(|err| format!("failed to remove stale snapshot: {err}"))?;
            }
            return Ok(());
        }
        Role::Inviter(state) => format!(
            "{SNAPSHOT_VERSION}|inviter|{}|-1|{}||{}|{}",
            state.session_id,
            state.short_device_id,
            state.round_up.latitude,
            state.round_up.longitude
        ),
        Role::Invitee(state) => format!(
            "{SNAPSHOT_VERSION}|invitee|{}|{}|{}|{}|{}|{}",
            state.session_id,
            state.invitee_id,
            state.inviter_short_device_id,
            state.inviter_name,
            state.round_up.latitude,
            state.round_up.longitude
        ),
    };

    let mut lines = vec![header];
    lines.extend(snapshot.retained.iter().map(notification_to_flat));

    fs::write(path, lines.join("\n"))
        .map_err(|err| format!("failed to write session snapshot: {err}"))
}

/// Rehydrates a snapshot. `None` means nothing usable was found.
pub fn load(path: &Path) -> Option<RestoredSession> {
    let content = fs::read_to_string(path).ok()?;
    let mut lines = content.lines();

    let header: Vec<&str> = lines.next()?.split('|').collect();
    if header.len() != 8 || header[0] != SNAPSHOT_VERSION {
        warn!("session snapshot header unreadable; discarding snapshot");
        return None;
    }

    let session_id: i64 = header[2].parse().ok()?;
    let invitee_id: i64 = header[3].parse().ok()?;
    let latitude: f64 = header[6].parse().ok()?;
    let longitude: f64 = header[7].parse().ok()?;
    let round_up = GeoPoint::new(latitude, longitude);

    let role = match header[1] {
        "inviter" => RestoredRole::Inviter {
            session_id,
            round_up,
        },
        "invitee" => RestoredRole::Invitee {
            session_id,
            invitee_id,
            inviter_short_device_id: header[4].to_string(),
            inviter_name: header[5].to_string(),
            round_up,
        },
        other => {
            warn!(role = other, "unknown role in session snapshot; discarding");
            return None;
        }
    };

    let mut retained = Vec::new();
    for line in lines {
        match notification_from_flat(line) {
            Some(notification) => retained.push(notification),
            None => debug!("corrupt notification record skipped during restore"),
        }
    }

    Some(RestoredSession { role, retained })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rondo_core::state::{InviteeState, InviterState};
    use rondo_protocol::{InviteeStatus, Notification, SessionStatus};

    fn point() -> GeoPoint {
        GeoPoint::new(51.50, -0.12)
    }

    fn notification(invitee_id: i64) -> Notification {
        Notification {
            id: 4,
            recipient: 1,
            session_id: 42,
            invitee_id,
            message_id: "InviteeHasAccepted".to_string(),
            data: "Bob".to_string(),
            short_device_id: "ABCD1234".to_string(),
            latitude: 51.49,
            longitude: -0.11,
        }
    }

    fn invitee_snapshot() -> StateSnapshot {
        StateSnapshot {
            role: Role::Invitee(InviteeState {
                session_id: 42,
                invitee_id: 7,
                session_status: SessionStatus::SessionActive,
                status: InviteeStatus::InviteeHasAccepted,
                inviter_short_device_id: "ABCD1234".to_string(),
                inviter_name: "Bob".to_string(),
                round_up: point(),
            }),
            retained: vec![notification(7)],
            changed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn invitee_snapshot_round_trips() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("session.state");

        save(&path, &invitee_snapshot()).expect("save");
        let restored = load(&path).expect("load");

        let RestoredRole::Invitee {
            session_id,
            invitee_id,
            inviter_short_device_id,
            inviter_name,
            round_up,
        } = restored.role
        else {
            panic!("expected invitee role");
        };
        assert_eq!(session_id, 42);
        assert_eq!(invitee_id, 7);
        assert_eq!(inviter_short_device_id, "ABCD1234");
        assert_eq!(inviter_name, "Bob");
        assert_eq!(round_up, point());
        assert_eq!(restored.retained, vec![notification(7)]);
    }

    #[test]
    fn inviter_snapshot_round_trips() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("session.state");

        let snapshot = StateSnapshot {
            role: Role::Inviter(InviterState {
                session_id: 42,
                status: SessionStatus::SessionActive,
                short_device_id: "ABCD1234".to_string(),
                round_up: point(),
                invitees: Vec::new(),
                any_joined: true,
            }),
            retained: Vec::new(),
            changed_at: chrono::Utc::now(),
        };
        save(&path, &snapshot).expect("save");

        let restored = load(&path).expect("load");
        assert!(matches!(
            restored.role,
            RestoredRole::Inviter { session_id: 42, .. }
        ));
        assert!(restored.retained.is_empty());
    }

    #[test]
    fn no_role_snapshot_removes_the_file() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("session.state");
        save(&path, &invitee_snapshot()).expect("seed");
        assert!(path.exists());

        let empty = StateSnapshot {
            role: Role::NoRole,
            retained: Vec::new(),
            changed_at: chrono::Utc::now(),
        };
        save(&path, &empty).expect("save");
        assert!(!path.exists());
        assert!(load(&path).is_none());
    }

    #[test]
    fn corrupt_header_discards_the_whole_snapshot() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("session.state");
        fs::write(&path, "RONDO1|invitee|forty-two|7|k|n|1|2").expect("write");
        assert!(load(&path).is_none());

        fs::write(&path, "OTHER9|invitee|42|7|k|n|1|2").expect("write");
        assert!(load(&path).is_none());
    }

    #[test]
    fn corrupt_notification_line_is_skipped_not_fatal() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("session.state");

        let good = notification_to_flat(&notification(7));
        let content = format!("RONDO1|invitee|42|7|ABCD1234|Bob|51.5|-0.12\ngarbage|line\n{good}");
        fs::write(&path, content).expect("write");

        let restored = load(&path).expect("load");
        assert_eq!(restored.retained, vec![notification(7)]);
    }
}
