//! Invite-code parsing and rendering.
//!
//! An invite travels as free-form human text (SMS, email, clipboard) with an
//! embedded `rndup://` uri: `rndup://<sessionId>?did=<8 chars>&nme=<alias>`.
//! Parsing is marker-driven rather than a full uri parse because the code is
//! routinely surrounded by arbitrary message text.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::SHORT_DEVICE_ID_LEN;

const SCHEME: &str = "rndup://";
const DID_MARKER: &str = "?did=";
const DID_MARKER_SLASH: &str = "/?did=";
const ALIAS_MARKER: &str = "&nme=";

/// Escape everything except unreserved characters, matching how the alias is
/// encoded on other platforms.
const ALIAS_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The parsed contents of a session invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteCode {
    /// Backend session (row) id.
    pub session_id: i64,
    /// The inviter's 8-char short device id, used as a capability token.
    pub short_device_id: String,
    /// The inviter's name/alias.
    pub alias: String,
}

impl InviteCode {
    /// Extracts an invite code from free-form text. Returns `None` for any
    /// malformed input: missing marker, non-integer session id, or a device
    /// id shorter than eight characters.
    pub fn parse(text: &str) -> Option<InviteCode> {
        let start = text.find(SCHEME)?;
        let code = text[start + SCHEME.len()..].trim();

        let did_at = code.find(DID_MARKER)?;
        let session_id: i64 = code[..did_at].parse().ok()?;

        let rest = &code[did_at + DID_MARKER.len()..];
        parse_did_and_alias(session_id, rest)
    }

    /// Extracts an invite code from a custom-uri app launch, e.g.
    /// `/Protocol?encodedLaunchUri=rndup://42/?did=ABCD1234&nme=Bob`.
    /// The optional trailing slash before `?did=` is tolerated.
    pub fn parse_launch_uri(text: &str) -> Option<InviteCode> {
        let start = text.find(SCHEME)?;
        let code = text[start + SCHEME.len()..].trim();

        let (did_at, marker_len) = match code.find(DID_MARKER_SLASH) {
            Some(at) => (at, DID_MARKER_SLASH.len()),
            None => (code.find(DID_MARKER)?, DID_MARKER.len()),
        };
        let session_id: i64 = code[..did_at].parse().ok()?;

        let rest = &code[did_at + marker_len..];
        parse_did_and_alias(session_id, rest)
    }

    /// Renders the shareable invite text: the friendly line, a newline, then
    /// the `rndup://` code with the alias percent-encoded.
    pub fn render(&self, friendly: &str) -> String {
        format!(
            "{}\n{}{}{}{}{}{}",
            friendly,
            SCHEME,
            self.session_id,
            DID_MARKER,
            self.short_device_id,
            ALIAS_MARKER,
            utf8_percent_encode(&self.alias, ALIAS_ENCODE)
        )
    }
}

fn parse_did_and_alias(session_id: i64, rest: &str) -> Option<InviteCode> {
    // The short device id is always exactly eight chars; char_indices keeps
    // this safe if the surrounding text smuggles in multi-byte characters.
    let did_end = rest
        .char_indices()
        .nth(SHORT_DEVICE_ID_LEN - 1)
        .map(|(i, c)| i + c.len_utf8())?;
    let short_device_id = &rest[..did_end];

    let after_did = &rest[did_end..];
    let alias_raw = after_did.strip_prefix(ALIAS_MARKER)?;

    // The alias runs to the first space or the end of the string; anything
    // after the space is trailing message text.
    let alias_encoded = match alias_raw.find(' ') {
        Some(space) => &alias_raw[..space],
        None => alias_raw,
    };
    let alias = percent_decode_str(alias_encoded)
        .decode_utf8()
        .ok()?
        .into_owned();

    Some(InviteCode {
        session_id,
        short_device_id: short_device_id.to_string(),
        alias,
    })
}
