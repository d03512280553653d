//! Pipe-delimited flattened record representation.
//!
//! Used to persist engine state across process death. Fields appear in a
//! fixed order; empty string fields serialize as empty segments. A record
//! that fails numeric parsing on restore is corrupt and is discarded by the
//! caller, never an error that propagates.

use crate::Notification;

/// Flattens a notification to
/// `id|Recipient|SessionId|InviteeId|MessageId|Data|ShortDeviceId|Latitude|Longitude`.
pub fn notification_to_flat(n: &Notification) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}",
        n.id,
        n.recipient,
        n.session_id,
        n.invitee_id,
        n.message_id,
        n.data,
        n.short_device_id,
        n.latitude,
        n.longitude
    )
}

/// Rehydrates a notification from its flattened representation. Returns
/// `None` when the segment count is wrong or a numeric field fails to parse.
pub fn notification_from_flat(line: &str) -> Option<Notification> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 9 {
        return None;
    }

    Some(Notification {
        id: fields[0].parse().ok()?,
        recipient: fields[1].parse().ok()?,
        session_id: fields[2].parse().ok()?,
        invitee_id: fields[3].parse().ok()?,
        message_id: fields[4].to_string(),
        data: fields[5].to_string(),
        short_device_id: fields[6].to_string(),
        latitude: fields[7].parse().ok()?,
        longitude: fields[8].parse().ok()?,
    })
}
